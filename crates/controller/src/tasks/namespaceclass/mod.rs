pub mod controller;
pub mod resources;

pub use controller::{error_policy, reconcile, NamespaceClassReconciler, ReconcileOutcome};
pub use resources::{synthesize, ChildResource, DesiredChildren};
