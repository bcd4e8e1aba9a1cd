//! モデル定義
//!
//! dataiku-iac で使用されるデータモデルを定義します。

mod config;
mod resource;

// Re-exports
pub use config::*;
pub use resource::*;
