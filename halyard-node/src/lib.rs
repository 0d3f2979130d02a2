//! A Halyard node: lease-based master election, log replication to the
//! other voters, learner catchup and the client request executor.
//!
//! [`NodeService`] is the entry point. [`LocalCluster`] runs a whole cluster
//! in one process over a [`halyard_core::LocalNetwork`]; the binary wires
//! nodes together with [`TcpTransport`] and [`PeerServer`].

mod catchup;
pub use catchup::CatchupState;

mod election;
pub use election::{ElectionState, Elector};

mod local_cluster;
pub use local_cluster::LocalCluster;

mod node;

pub mod node_config;
pub use node_config::{ElectionMode, NodeConfig, DEFAULT_MAX_VALUE_SIZE};

pub mod node_metrics;

mod node_service;
pub use node_service::NodeService;

mod replication;

mod sequence;
pub use sequence::SequenceExecutor;

pub mod service_configuration;
pub use service_configuration::{LoadConfiguration, ServiceConfiguration};

mod state_machine;
pub use state_machine::{AppliedState, StateMachine};

mod tcp_transport;
pub use tcp_transport::{PeerServer, TcpTransport};

pub mod wire;
