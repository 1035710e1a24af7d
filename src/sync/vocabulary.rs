//! 从远端集合列表刷新机构层级和资源类型

use std::collections::HashMap;
use tracing::info;

use crate::crawler::{OaiClient, SetEntry};
use crate::storage::entities::{self, Vocabulary};
use crate::storage::models::InstituteNode;
use crate::storage::Database;
use crate::utils::GzResult;

fn under_prefix<'a>(sets: &'a [SetEntry], prefix: &str) -> impl Iterator<Item = &'a SetEntry> {
    let scoped = format!("{}:", prefix);
    sets.iter().filter(move |set| set.spec.starts_with(&scoped))
}

/// 按 `setSpec` 的 `:` 层级构建机构树
///
/// `subjects:econ:banking` 是 `subjects:econ` 的子节点；父集合缺失时作为根节点。
pub fn build_institute_tree(sets: &[SetEntry], prefix: &str) -> Vec<InstituteNode> {
    let names: HashMap<&str, &str> = under_prefix(sets, prefix)
        .map(|set| (set.spec.as_str(), set.name.as_str()))
        .collect();

    let mut roots = Vec::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for set in under_prefix(sets, prefix) {
        match set.spec.rsplit_once(':') {
            Some((parent, _)) if names.contains_key(parent) => {
                children.entry(parent).or_default().push(set.spec.as_str())
            }
            _ => roots.push(set.spec.as_str()),
        }
    }

    fn build(spec: &str, names: &HashMap<&str, &str>, children: &HashMap<&str, Vec<&str>>) -> InstituteNode {
        let kids = children
            .get(spec)
            .map(|specs| specs.iter().map(|child| build(child, names, children)).collect())
            .unwrap_or_default();
        InstituteNode::with_children(names[spec], kids)
    }

    roots.into_iter().map(|spec| build(spec, &names, &children)).collect()
}

pub fn resource_type_names(sets: &[SetEntry], prefix: &str) -> Vec<String> {
    under_prefix(sets, prefix).map(|set| set.name.clone()).collect()
}

/// 拉取并保存机构层级，返回新建节点数
pub async fn load_institutes(client: &OaiClient, db: &Database, prefix: &str) -> GzResult<usize> {
    let sets = client.list_sets().await?;
    let roots = build_institute_tree(&sets, prefix);

    let mut tx = db.begin().await?;
    let created = entities::store_institute_tree(&mut tx, &roots).await?;
    tx.commit().await?;

    info!("机构层级已更新: {} 个顶层机构，新建 {} 个节点", roots.len(), created);
    Ok(created)
}

/// 拉取并保存资源类型，返回资源类型总数
pub async fn load_resource_types(client: &OaiClient, db: &Database, prefix: &str) -> GzResult<usize> {
    let sets = client.list_sets().await?;
    let names = resource_type_names(&sets, prefix);

    let mut tx = db.begin().await?;
    for name in &names {
        entities::get_or_create_named(&mut tx, Vocabulary::ResourceType, name).await?;
    }
    tx.commit().await?;

    info!("资源类型已更新: {} 个", names.len());
    Ok(names.len())
}
