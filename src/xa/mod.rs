pub mod manager;

pub use manager::{ClusterOutcomes, XaManager};
