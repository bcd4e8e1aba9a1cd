//! パース済み設定
//!
//! KDLファイルから得られる宣言の集合。グラフ構築の入力となる。

use super::resource::{ResourceAddress, ResourceDecl};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// 変数コンテキスト
pub type Variables = HashMap<String, serde_json::Value>;

/// 環境（dev, prod など）ごとの定義
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDecl {
    /// 環境固有の変数（グローバル変数を上書き）
    #[serde(default)]
    pub variables: Variables,

    /// 環境固有のリソース宣言・オーバーライド
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// パース済み設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedConfig {
    /// 設定の名前（ディレクトリ名または workspace ノード）
    pub name: String,

    /// グローバル変数
    #[serde(default)]
    pub variables: Variables,

    /// 環境定義
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentDecl>,

    /// 宣言順のリソース（重複はグラフ構築時に検出）
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

impl ParsedConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 指定アドレスの最初の宣言を取得
    pub fn resource(&self, address: &ResourceAddress) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| &r.address == address)
    }

    /// 環境のオーバーレイを適用
    ///
    /// 環境の変数はグローバル変数を上書きし、環境内のリソースは
    /// 同じアドレスの宣言へマージされる（存在しなければ追加）。
    pub fn apply_environment(&mut self, environment: &str) -> bool {
        let Some(env) = self.environments.get(environment).cloned() else {
            return false;
        };

        self.variables.extend(env.variables);
        for decl in env.resources {
            self.merge_resource(decl);
        }
        true
    }

    /// オーバーライドファイル（dataiku.{env}.kdl など）の内容をマージ
    pub fn merge_override(&mut self, other: ParsedConfig) {
        self.variables.extend(other.variables);
        for (name, env) in other.environments {
            let target = self.environments.entry(name).or_default();
            target.variables.extend(env.variables);
            target.resources.extend(env.resources);
        }
        for decl in other.resources {
            self.merge_resource(decl);
        }
    }

    /// 別ファイルの宣言を追加（resources/*.kdl など）
    ///
    /// リソースはマージせず追加するため、重複はグラフ構築時に検出される。
    pub fn append(&mut self, other: ParsedConfig) {
        self.variables.extend(other.variables);
        for (name, env) in other.environments {
            let target = self.environments.entry(name).or_default();
            target.variables.extend(env.variables);
            target.resources.extend(env.resources);
        }
        self.resources.extend(other.resources);
    }

    fn merge_resource(&mut self, decl: ResourceDecl) {
        if let Some(existing) = self
            .resources
            .iter_mut()
            .find(|r| r.address == decl.address)
        {
            existing.merge(decl);
        } else {
            self.resources.push(decl);
        }
    }
}
