//! # kvmesh-transport-http
//!
//! 为 `kvmesh-core` 的配置监听器提供基于 `reqwest` 的流式配置源。
//!
//! ```ignore
//! let source = Arc::new(HttpStreamingConfigSource::new(&options)?);
//! let cluster = Cluster::connect(options, connector, source, &cancel).await?;
//! ```

mod source;

pub use source::HttpStreamingConfigSource;
