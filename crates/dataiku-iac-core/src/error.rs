use crate::model::ResourceAddress;
use std::path::PathBuf;
use thiserror::Error;

/// 設定の読み込み・パース・テンプレート展開のエラー
///
/// いずれもユーザーが設定を修正すれば解消するもので、
/// 状態やライブ環境を変更する前に処理を中断させる。
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("KDLパースエラー: {0}")]
    Syntax(#[from] kdl::KdlError),

    #[error("スキーマエラー: {0}")]
    Schema(String),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("テンプレート展開エラー: {0}")]
    TemplateRenderError(String),

    #[error("ファイル発見エラー: {path}\n理由: {message}")]
    DiscoveryError { path: PathBuf, message: String },

    #[error(
        "プロジェクトルートが見つかりません\n探索開始位置: {0}\nヒント: dataiku.kdl ファイルを含むディレクトリで実行してください"
    )]
    ProjectRootNotFound(PathBuf),

    #[error("環境が見つかりません: {0}")]
    EnvironmentNotFound(String),
}

impl ConfigError {
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }
}

/// リソースグラフ構築時のエラー
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("リソースが重複しています: {0}")]
    DuplicateResource(ResourceAddress),

    #[error("{from} の依存先 {to} が宣言されていません")]
    UnresolvedReference {
        from: ResourceAddress,
        to: ResourceAddress,
    },

    #[error("{address} の変数展開に失敗しました: {source}")]
    Substitution {
        address: ResourceAddress,
        #[source]
        source: ConfigError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
