mod app_name;
mod installed;
mod manifest;
mod operation_id;
mod plan;
mod rebuild_id;

pub use app_name::{AppName, AppNameError};
pub use installed::{AppStatus, Binding, InstalledApp, Invalidation};
pub use manifest::{
    AppManifest, CompatibleSource, ConsumedIntegration, EnvFileSpec, HealthCheckSpec,
    ProvidedIntegration, SsoSpec, SsoStrategy, WebSpec,
};
pub use operation_id::{OperationId, OperationIdError};
pub use plan::{Choice, InstallPlan, PlannedBinding, RemovePlan};
pub use rebuild_id::{RebuildId, RebuildIdError};
