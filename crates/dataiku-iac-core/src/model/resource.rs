//! 管理対象リソースのモデル
//!
//! DSS上のプロジェクト・データセット・レシピ・シナリオを表す型の定義

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// リソース属性（キー順に整列して決定的に扱う）
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// リソース種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Project,
    Dataset,
    Recipe,
    Scenario,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Project,
        ResourceKind::Dataset,
        ResourceKind::Recipe,
        ResourceKind::Scenario,
    ];

    /// 文字列からパース（KDLノード名・参照文字列で使用）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "project" => Some(Self::Project),
            "dataset" => Some(Self::Dataset),
            "recipe" => Some(Self::Recipe),
            "scenario" => Some(Self::Scenario),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Dataset => "dataset",
            Self::Recipe => "recipe",
            Self::Scenario => "scenario",
        }
    }

    /// プロジェクト配下に属する種別かどうか
    pub fn is_scoped(&self) -> bool {
        !matches!(self, Self::Project)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// リソースのアドレス
///
/// 種別・所属プロジェクト・名前の組で一意に識別される。
/// プロジェクト自身は `project` が `None`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceAddress {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub name: String,
}

impl ResourceAddress {
    pub fn project(key: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Project,
            project: None,
            name: key.into(),
        }
    }

    pub fn scoped(kind: ResourceKind, project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            project: Some(project.into()),
            name: name.into(),
        }
    }

    pub fn dataset(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ResourceKind::Dataset, project, name)
    }

    pub fn recipe(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ResourceKind::Recipe, project, name)
    }

    pub fn scenario(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self::scoped(ResourceKind::Scenario, project, name)
    }

    /// 所属プロジェクトのキー（プロジェクト自身なら自分の名前）
    pub fn project_key(&self) -> &str {
        self.project.as_deref().unwrap_or(&self.name)
    }

    /// 所属プロジェクトのアドレス（プロジェクト自身は None）
    pub fn parent(&self) -> Option<ResourceAddress> {
        self.project.as_ref().map(|p| ResourceAddress::project(p.clone()))
    }

    /// 参照文字列をパース
    ///
    /// 形式:
    /// - `project:KEY`
    /// - `kind:NAME`（`default_project` のスコープで解決）
    /// - `kind:PROJECT.NAME`
    pub fn parse_ref(reference: &str, default_project: Option<&str>) -> Option<Self> {
        let (kind, rest) = reference.split_once(':')?;
        let kind = ResourceKind::parse(kind.trim())?;
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }

        if !kind.is_scoped() {
            return Some(Self::project(rest));
        }

        match rest.split_once('.') {
            Some((project, name)) if !project.is_empty() && !name.is_empty() => {
                Some(Self::scoped(kind, project, name))
            }
            Some(_) => None,
            None => default_project.map(|p| Self::scoped(kind, p, rest)),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}:{}.{}", self.kind, project, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

// 名前 → 種別 → プロジェクトの順で比較する。
// 同順位のエントリを識別子の昇順で並べるための順序。
impl Ord for ResourceAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.project.cmp(&other.project))
    }
}

impl PartialOrd for ResourceAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 設定ファイルで宣言されたリソース
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub address: ResourceAddress,

    /// 宣言された属性（変数展開前）
    #[serde(default)]
    pub attributes: Attributes,

    /// 明示的・暗黙的な依存先
    #[serde(default)]
    pub depends_on: Vec<ResourceAddress>,
}

impl ResourceDecl {
    pub fn new(address: ResourceAddress) -> Self {
        Self {
            address,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_dependency(mut self, address: ResourceAddress) -> Self {
        self.add_dependency(address);
        self
    }

    /// 依存先を追加（重複は無視）
    ///
    /// 自己参照も保持し、計画時に循環依存として報告させる。
    pub fn add_dependency(&mut self, address: ResourceAddress) {
        if !self.depends_on.contains(&address) {
            self.depends_on.push(address);
        }
    }

    /// 別の宣言で上書き（環境オーバーライド用）
    ///
    /// 属性はキー単位で上書き、依存先は和集合。
    pub fn merge(&mut self, other: ResourceDecl) {
        self.attributes.extend(other.attributes);
        for dep in other.depends_on {
            self.add_dependency(dep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(ResourceAddress::project("DEMO").to_string(), "project:DEMO");
        assert_eq!(
            ResourceAddress::dataset("DEMO", "TEST_DATA").to_string(),
            "dataset:DEMO.TEST_DATA"
        );
    }

    #[test]
    fn test_parse_ref_scoped_default_project() {
        let addr = ResourceAddress::parse_ref("dataset:TEST_DATA", Some("DEMO")).unwrap();
        assert_eq!(addr, ResourceAddress::dataset("DEMO", "TEST_DATA"));
    }

    #[test]
    fn test_parse_ref_cross_project() {
        let addr = ResourceAddress::parse_ref("recipe:OTHER.build", Some("DEMO")).unwrap();
        assert_eq!(addr, ResourceAddress::recipe("OTHER", "build"));
    }

    #[test]
    fn test_parse_ref_project() {
        let addr = ResourceAddress::parse_ref("project:DEMO", None).unwrap();
        assert_eq!(addr, ResourceAddress::project("DEMO"));
    }

    #[test]
    fn test_parse_ref_invalid() {
        assert!(ResourceAddress::parse_ref("notebook:X", Some("DEMO")).is_none());
        assert!(ResourceAddress::parse_ref("dataset", Some("DEMO")).is_none());
        assert!(ResourceAddress::parse_ref("dataset:X", None).is_none());
        assert!(ResourceAddress::parse_ref("dataset:.X", None).is_none());
    }

    #[test]
    fn test_address_ordering_by_name_first() {
        let mut addrs = vec![
            ResourceAddress::dataset("DEMO", "TEST_DATA"),
            ResourceAddress::project("DEMO"),
            ResourceAddress::recipe("DEMO", "A_RECIPE"),
        ];
        addrs.sort();
        assert_eq!(addrs[0], ResourceAddress::recipe("DEMO", "A_RECIPE"));
        assert_eq!(addrs[1], ResourceAddress::project("DEMO"));
        assert_eq!(addrs[2], ResourceAddress::dataset("DEMO", "TEST_DATA"));
    }

    #[test]
    fn test_decl_merge_overrides_attributes() {
        let mut base = ResourceDecl::new(ResourceAddress::project("DEMO"))
            .with_attribute("name", serde_json::json!("Demo"))
            .with_attribute("owner", serde_json::json!("alice"));
        let overlay = ResourceDecl::new(ResourceAddress::project("DEMO"))
            .with_attribute("owner", serde_json::json!("bob"));

        base.merge(overlay);
        assert_eq!(base.attributes["name"], serde_json::json!("Demo"));
        assert_eq!(base.attributes["owner"], serde_json::json!("bob"));
    }

    #[test]
    fn test_self_dependency_kept() {
        let addr = ResourceAddress::project("DEMO");
        let decl = ResourceDecl::new(addr.clone())
            .with_dependency(addr.clone())
            .with_dependency(addr.clone());
        assert_eq!(decl.depends_on, vec![addr]);
    }
}
