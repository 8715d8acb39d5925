pub mod extraction;
pub mod reconcile;
