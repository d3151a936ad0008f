use http_api_problem::HttpApiProblem;
use rocket::http::{Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::convert::From;
use std::io::Cursor;

pub type HttpResult<T> = Result<T, HttpApiError>;

#[derive(Debug)]
pub struct HttpApiError(HttpApiProblem);

impl From<HttpApiProblem> for HttpApiError {
    fn from(problem: HttpApiProblem) -> Self {
        Self(problem)
    }
}

impl<'r> Responder<'r, 'static> for HttpApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        if self.0.status == Some(http_api_problem::StatusCode::NO_CONTENT) {
            return rocket::response::status::NoContent.respond_to(request);
        }

        let payload = self.0.json_bytes();
        Response::build()
            .header(Header::new("Content-Type", "application/problem+json"))
            .status(
                self.0
                    .status
                    .and_then(|status| Status::from_code(status.as_u16()))
                    .unwrap_or_default(),
            )
            .sized_body(payload.len(), Cursor::new(payload))
            .ok()
    }
}
