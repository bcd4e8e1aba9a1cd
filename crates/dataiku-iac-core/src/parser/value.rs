//! KDLノードから値を取り出すヘルパー

use kdl::{KdlNode, KdlValue};

/// KDL値をJSON値に変換
pub fn kdl_value_to_json(value: &KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        // i128をi64に変換してからJSONに変換
        serde_json::Value::Number((i as i64).into())
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else {
        serde_json::Value::Null
    }
}

/// 最初の位置引数
pub(crate) fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

/// 最初の位置引数を文字列として取得
pub(crate) fn first_string(node: &KdlNode) -> Option<&str> {
    first_arg(node).and_then(|v| v.as_string())
}

/// 位置引数のうち文字列のものを全て取得
pub(crate) fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string().map(|s| s.to_string()))
        .collect()
}

/// プロパティ（key=value）を取得
pub(crate) fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .map(|e| e.value())
}

/// 属性ノードをJSON値に変換
///
/// - 子ブロックあり: オブジェクト
/// - プロパティのみ: オブジェクト
/// - 引数1つ: その値
/// - 引数複数: 配列
/// - 引数なし: null
pub(crate) fn node_to_json(node: &KdlNode) -> serde_json::Value {
    if let Some(children) = node.children() {
        let map = children
            .nodes()
            .iter()
            .map(|child| (child.name().value().to_string(), node_to_json(child)))
            .collect();
        return serde_json::Value::Object(map);
    }

    let args: Vec<serde_json::Value> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| kdl_value_to_json(e.value()))
        .collect();

    if args.is_empty() {
        let props: serde_json::Map<String, serde_json::Value> = node
            .entries()
            .iter()
            .filter_map(|e| {
                e.name()
                    .map(|n| (n.value().to_string(), kdl_value_to_json(e.value())))
            })
            .collect();
        if props.is_empty() {
            return serde_json::Value::Null;
        }
        return serde_json::Value::Object(props);
    }

    if args.len() == 1 {
        args.into_iter().next().unwrap_or(serde_json::Value::Null)
    } else {
        serde_json::Value::Array(args)
    }
}
