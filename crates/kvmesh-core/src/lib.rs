//! # kvmesh-core
//!
//! ## 定位（Why）
//! - 键值集群客户端的核心：维护到集群各节点的已认证连接集合，并在拓扑变化时保持其一致；
//! - 只定义发现、建连、认证、监控与退役节点的机制；具体传输（TCP、HTTP 流）由独立 crate 实现
//!   [`connection::Connector`] 与 [`listener::ConfigStreamSource`]。
//!
//! ## 数据流（How）
//! ```text
//! 配置流 → ConfigListener → ConfigHandler（按版本去重）→ ClusterContext::apply
//!        → ClusterNodeFactory（创建）/ ClusterNode::dispose（退役）→ 注册表 → 服务选点
//! ```
//!
//! ## 模块地图（What）
//! - 数据模型：[`endpoint`]、[`service`]、[`topology`]；
//! - 节点生命周期：[`connection`]、[`protocol`]、[`sasl`]、[`bootstrap`]、[`pool`]、
//!   [`circuit_breaker`]、[`node`]、[`node_factory`]；
//! - 拓扑：[`cluster_context`]、[`config_handler`]、[`listener`]、[`service_uri`]、[`cluster`]；
//! - 环境：[`error`]、[`options`]、[`time`]、[`logging`]、[`test_stubs`]。

pub mod bootstrap;
pub mod circuit_breaker;
pub mod cluster;
pub mod cluster_context;
pub mod config_handler;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod logging;
pub mod node;
pub mod node_factory;
pub mod options;
pub mod pool;
pub mod protocol;
pub mod sasl;
pub mod service;
pub mod service_uri;
pub mod test_stubs;
pub mod time;
pub mod topology;

pub use circuit_breaker::{CallOutcome, CircuitBreaker, CircuitState};
pub use cluster::Cluster;
pub use cluster_context::{ClusterContext, NodeRegistry, ReconcileReport};
pub use config_handler::{ConfigHandler, PublishOutcome};
pub use connection::{Connection, Connector, SharedConnection, SharedConnector};
pub use endpoint::HostEndpoint;
pub use error::{ErrorCategory, KvError, Result};
pub use listener::{ConfigListener, ConfigStreamSource, ListenerState, StreamRequest};
pub use node::{ClusterNode, NodeKey, SharedNode};
pub use node_factory::{ClusterNodeFactory, DefaultClusterNodeFactory, SharedNodeFactory};
pub use options::{CircuitBreakerOptions, ClusterOptions, Credentials, PoolOptions, StreamingOptions};
pub use pool::{ConnectionPool, PooledConnection};
pub use sasl::MechanismType;
pub use service::ServiceType;
pub use service_uri::ServiceUriProvider;
pub use topology::{BucketConfig, BucketType, ConfigVersion, NodeAdapter, NodeIdentity};
