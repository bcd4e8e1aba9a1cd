//! dataiku-iac コア
//!
//! DSSリソース（プロジェクト・データセット・レシピ・シナリオ）の宣言モデル、
//! KDL設定ファイルのパーサー、テンプレート展開、リソース依存グラフを提供します。
//!
//! ```text
//! discovery → parser → (overrides / environment) → GraphBuilder(+ Substitute) → ResourceGraph
//! ```

pub mod discovery;
pub mod error;
pub mod graph;
pub mod loader;
pub mod model;
pub mod parser;
pub mod template;

// Re-exports
pub use discovery::{DiscoveredFiles, discover_files, discover_files_with_environment, find_project_root};
pub use error::{ConfigError, GraphError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceNode};
pub use loader::{
    LoadedProject, load_project, load_project_from_root, load_project_from_root_with_environment,
};
pub use model::*;
pub use parser::{parse_kdl_file, parse_kdl_string};
pub use template::{Substitute, TemplateProcessor};
