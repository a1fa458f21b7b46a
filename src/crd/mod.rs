mod mongo_cluster;

pub use mongo_cluster::*;
