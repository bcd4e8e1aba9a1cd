//! ファイル自動発見機能
//!
//! 規約ベースのディレクトリ構造からKDLファイルを自動的に発見します。
//!
//! ```text
//! <project_root>/
//! ├── dataiku.kdl            # ルートファイル（または .dataiku-iac/dataiku.kdl）
//! ├── dataiku.prod.kdl       # 環境固有オーバーライド
//! ├── dataiku.local.kdl      # ローカルオーバーライド
//! ├── resources/**/*.kdl     # リソース定義
//! ├── variables/**/*.kdl     # 変数定義
//! ├── .env
//! └── .env.prod
//! ```

use crate::error::{ConfigError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// プロジェクトルートを示すディレクトリ名
pub const PROJECT_DIR: &str = ".dataiku-iac";

/// ルートファイル名
pub const ROOT_FILE: &str = "dataiku.kdl";

/// 発見されたファイル群
#[derive(Debug, Clone, Default)]
pub struct DiscoveredFiles {
    /// ルートファイル (dataiku.kdl)
    pub root: Option<PathBuf>,
    /// リソース定義ファイル (resources/**/*.kdl)
    pub resources: Vec<PathBuf>,
    /// 変数定義ファイル (variables/**/*.kdl)
    pub variables: Vec<PathBuf>,
    /// 環境固有オーバーライドファイル (dataiku.{env}.kdl)
    pub environment_override: Option<PathBuf>,
    /// ローカルオーバーライドファイル (dataiku.local.kdl)
    pub local_override: Option<PathBuf>,
    /// 環境変数ファイル (.env)
    pub env_file: Option<PathBuf>,
    /// 環境固有の環境変数ファイル (.env.{env})
    pub environment_env_file: Option<PathBuf>,
}

impl DiscoveredFiles {
    /// パース対象のKDLファイルを読み込み順で返す
    ///
    /// dataiku.kdl → variables → resources の順。オーバーライドファイルは含まない。
    pub fn base_files(&self) -> Vec<&Path> {
        self.root
            .iter()
            .chain(self.variables.iter())
            .chain(self.resources.iter())
            .map(PathBuf::as_path)
            .collect()
    }
}

/// プロジェクトルートを検出
///
/// 以下の優先順位で検索:
/// 1. 環境変数 DATAIKU_IAC_PROJECT_ROOT
/// 2. カレントディレクトリから上に向かって以下を探す:
///    - dataiku.kdl
///    - .dataiku-iac/dataiku.kdl
#[tracing::instrument]
pub fn find_project_root() -> Result<PathBuf> {
    // 1. 環境変数
    if let Ok(root) = std::env::var("DATAIKU_IAC_PROJECT_ROOT") {
        let path = PathBuf::from(&root);
        debug!(env_root = %root, "Checking DATAIKU_IAC_PROJECT_ROOT");
        if is_project_root(&path) {
            info!(project_root = %path.display(), "Found project root from environment variable");
            return Ok(path);
        }
    }

    // 2. カレントディレクトリから上に向かって探す
    let start_dir = std::env::current_dir()?;
    find_project_root_from(&start_dir)
}

/// 指定ディレクトリから上に向かってプロジェクトルートを探す
pub fn find_project_root_from(start_dir: &Path) -> Result<PathBuf> {
    let mut current = start_dir.to_path_buf();
    debug!(start_dir = %start_dir.display(), "Searching for project root");

    loop {
        if is_project_root(&current) {
            info!(project_root = %current.display(), "Found project root");
            return Ok(current);
        }

        // 親ディレクトリへ
        if !current.pop() {
            break;
        }
    }

    warn!(start_dir = %start_dir.display(), "Project root not found");
    Err(ConfigError::ProjectRootNotFound(start_dir.to_path_buf()))
}

fn is_project_root(dir: &Path) -> bool {
    dir.join(ROOT_FILE).exists() || dir.join(PROJECT_DIR).join(ROOT_FILE).exists()
}

/// プロジェクトルートからファイルを自動発見
#[tracing::instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn discover_files(project_root: &Path) -> Result<DiscoveredFiles> {
    discover_files_with_environment(project_root, None)
}

/// 環境指定でプロジェクトルートからファイルを自動発見
///
/// environment が指定されている場合、dataiku.{env}.kdl と .env.{env} も検出します。
#[tracing::instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn discover_files_with_environment(
    project_root: &Path,
    environment: Option<&str>,
) -> Result<DiscoveredFiles> {
    debug!("Starting file discovery");
    let mut discovered = DiscoveredFiles {
        root: find_with_fallback(project_root, ROOT_FILE),
        ..Default::default()
    };

    // resources/**/*.kdl
    let resources_dir = project_root.join("resources");
    if resources_dir.is_dir() {
        discovered.resources = discover_kdl_files(&resources_dir)?;
        info!(
            resource_file_count = discovered.resources.len(),
            "Discovered resource files"
        );
    }

    // variables/**/*.kdl
    let variables_dir = project_root.join("variables");
    if variables_dir.is_dir() {
        discovered.variables = discover_kdl_files(&variables_dir)?;
        info!(
            variable_file_count = discovered.variables.len(),
            "Discovered variable files"
        );
    }

    // 環境指定時のみ
    if let Some(env) = environment {
        discovered.environment_override =
            find_with_fallback(project_root, &format!("dataiku.{env}.kdl"));
        discovered.environment_env_file = find_with_fallback(project_root, &format!(".env.{env}"));
    }

    discovered.local_override = find_with_fallback(project_root, "dataiku.local.kdl");
    discovered.env_file = find_with_fallback(project_root, ".env");

    Ok(discovered)
}

/// `<root>/<name>` を優先し、なければ `<root>/.dataiku-iac/<name>` を返す
fn find_with_fallback(project_root: &Path, name: &str) -> Option<PathBuf> {
    let direct = project_root.join(name);
    if direct.exists() {
        debug!(file = %direct.display(), "Found file");
        return Some(direct);
    }
    let nested = project_root.join(PROJECT_DIR).join(name);
    if nested.exists() {
        debug!(file = %nested.display(), "Found file in .dataiku-iac/");
        return Some(nested);
    }
    None
}

/// ディレクトリ配下の .kdl ファイルを再帰的に発見
///
/// アルファベット順にソートして返す
fn discover_kdl_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut visited = HashSet::new();

    visit_dir(dir, &mut files, &mut visited)?;

    files.sort();

    Ok(files)
}

/// ディレクトリを再帰的に走査
fn visit_dir(dir: &Path, files: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    // 正規化されたパスでシンボリックリンクのループを検出
    let canonical_dir = dir.canonicalize().map_err(|e| ConfigError::DiscoveryError {
        path: dir.to_path_buf(),
        message: format!("パスの正規化に失敗: {}", e),
    })?;

    if !visited.insert(canonical_dir.clone()) {
        warn!(dir = %canonical_dir.display(), "Symlink loop detected, skipping");
        return Ok(());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::DiscoveryError {
        path: dir.to_path_buf(),
        message: format!("ディレクトリの読み込みに失敗: {}", e),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DiscoveryError {
            path: dir.to_path_buf(),
            message: format!("ディレクトリエントリの読み込みに失敗: {}", e),
        })?;
        let path = entry.path();

        if path.is_dir() {
            visit_dir(&path, files, visited)?;
        } else if path.extension().and_then(|s| s.to_str()) == Some("kdl") {
            files.push(path);
        }
    }

    Ok(())
}
