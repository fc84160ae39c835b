/// `DigitalOceanCluster` control loop
pub mod cluster;

/// Node pool membership diffing
pub mod node_pools;
