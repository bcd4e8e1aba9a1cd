use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: dataiku.local.kdl, .dataiku.local.kdl, dataiku.kdl, .dataiku.kdl\n\
        - ./.dataiku-iac/ ディレクトリ\n\
        - ~/.config/dataiku-iac/dataiku.kdl\n\
        または DATAIKU_IAC_CONFIG 環境変数で直接指定できます"
    )]
    ProjectFileNotFound,

    #[error("設定ファイルの形式が不正です: {path}\n理由: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("設定値が不正です: {key} = {value}")]
    InvalidValue { key: String, value: String },

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
