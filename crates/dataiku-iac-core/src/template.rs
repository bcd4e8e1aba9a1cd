//! テンプレート展開機能
//!
//! Teraを使用して属性値の変数展開を行います。

use crate::error::{ConfigError, Result};
use crate::model::Variables;
use std::path::Path;
use tera::{Context, Tera};
use tracing::{debug, info};

/// 変数展開のインターフェース
///
/// グラフ構築時に属性値（文字列）を展開するために使用する。
pub trait Substitute {
    /// `raw` を `variables` で展開する
    fn substitute(&self, raw: &str, variables: &Variables) -> Result<String>;
}

/// テンプレートプロセッサ
///
/// 環境変数や .env ファイルから集めた変数をベースコンテキストとして保持する。
#[derive(Debug, Clone)]
pub struct TemplateProcessor {
    context: Context,
}

impl TemplateProcessor {
    /// 新しいテンプレートプロセッサを作成
    pub fn new() -> Self {
        Self {
            context: Context::new(),
        }
    }

    /// 変数を追加
    pub fn add_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), &value);
    }

    /// 複数の変数を追加
    pub fn add_variables(&mut self, variables: Variables) {
        for (key, value) in variables {
            self.context.insert(key, &value);
        }
    }

    /// 環境変数を追加（安全なもののみ）
    ///
    /// セキュリティ上の理由から、以下のプレフィックスを持つ環境変数のみを許可:
    /// - DATAIKU_*: dataiku-iac専用の環境変数
    /// - CI_*: CI/CD環境の変数
    /// - APP_*: アプリケーション設定
    #[tracing::instrument(skip(self))]
    pub fn add_env_variables(&mut self) {
        const ALLOWED_PREFIXES: &[&str] = &["DATAIKU_", "CI_", "APP_"];
        let mut count = 0;

        for (key, value) in std::env::vars() {
            if ALLOWED_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix))
            {
                debug!(key = %key, "Adding environment variable");
                self.context.insert(key, &serde_json::Value::String(value));
                count += 1;
            }
        }

        info!(
            env_var_count = count,
            "Added filtered environment variables"
        );
    }

    /// .env ファイルから変数を読み込んで追加
    ///
    /// .env ファイルの変数はプレフィックス制限なしで全て読み込まれます。
    #[tracing::instrument(skip(self))]
    pub fn add_env_file_variables(&mut self, env_file_path: &Path) -> Result<()> {
        let content =
            std::fs::read_to_string(env_file_path).map_err(|e| ConfigError::IoError {
                path: env_file_path.to_path_buf(),
                message: e.to_string(),
            })?;

        let mut count = 0;
        for line in content.lines() {
            let line = line.trim();

            // 空行とコメント行をスキップ
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = strip_quotes(value.trim());

                debug!(key = %key, "Adding variable from .env file");
                self.context
                    .insert(key, &serde_json::Value::String(value.to_string()));
                count += 1;
            }
        }

        info!(
            env_file = %env_file_path.display(),
            variable_count = count,
            "Loaded variables from .env file"
        );

        Ok(())
    }

    /// 文字列をテンプレートとして展開
    pub fn render_str(&self, template: &str) -> Result<String> {
        render_with(template, &self.context)
    }
}

impl Default for TemplateProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Substitute for TemplateProcessor {
    fn substitute(&self, raw: &str, variables: &Variables) -> Result<String> {
        // テンプレート構文を含まない文字列はそのまま返す
        if !raw.contains("{{") && !raw.contains("{%") {
            return Ok(raw.to_string());
        }

        let mut context = self.context.clone();
        for (key, value) in variables {
            context.insert(key.as_str(), value);
        }
        render_with(raw, &context)
    }
}

fn render_with(template: &str, context: &Context) -> Result<String> {
    Tera::one_off(template, context, false)
        .map_err(|e| ConfigError::TemplateRenderError(extract_tera_error_detail(&e)))
}

/// クォートを除去するヘルパー関数
///
/// "value" → value
/// 'value' → value
/// value → value
fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Teraエラーから詳細情報を抽出
///
/// Teraのエラーメッセージを解析して、未定義変数などの具体的な情報を取得します。
fn extract_tera_error_detail(e: &tera::Error) -> String {
    use std::error::Error;

    let mut details = Vec::new();
    details.push(e.to_string());

    let mut source = e.source();
    while let Some(err) = source {
        details.push(err.to_string());
        source = err.source();
    }

    let full_error = details.join(" | ");

    if full_error.contains("not found in context") {
        // 変数名を抽出: "Variable `xxx` not found in context"
        if let Some(start) = full_error.find("Variable `")
            && let Some(end) = full_error[start..].find("` not found")
        {
            let var_name = &full_error[start + 10..start + end];
            return format!(
                "未定義の変数: `{}`\nヒント: variables ブロックで定義するか、.env ファイルに追加してください",
                var_name
            );
        }
    }

    if full_error.contains("Filter") && full_error.contains("not found") {
        return format!("未定義のフィルター\n詳細: {full_error}");
    }

    full_error
}
