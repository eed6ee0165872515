pub mod address;
pub mod clusterdescription;
pub mod connection;
pub mod connectionpool;
pub mod environment;
pub mod error;
pub mod events;
mod heartbeatdelay;
pub mod hello;
pub mod operationcontext;
pub mod options;
pub mod roundtriptimemonitor;
pub mod selectedserver;
pub mod server;
pub mod serverchannel;
pub mod serverdescription;
pub mod serverfactory;
pub mod servermonitor;
pub mod topologyversion;
