pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod ring;
pub mod server;

/// Generated types for the `LBNodeManager` control-plane RPC surface.
/// Method/field/service names match `proto/consensus.proto` exactly, which
/// in turn matches the wire contract documented for the deployed fleet.
pub mod pb {
    tonic::include_proto!("gale.consensus");
}
