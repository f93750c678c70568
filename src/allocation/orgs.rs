//! Organizational ownership-chain matching for community priority.

use std::collections::{HashMap, HashSet};

use diesel::prelude::*;
use uuid::Uuid;

use crate::allocation::types::{CommunityOrganization, Organization};
use crate::shared::schema::{community_organizations, organizations};

#[derive(Debug, Clone)]
pub struct OrgNode {
    pub name: String,
    pub parent_id: Option<Uuid>,
}

/// Walks a member's ownership chain upward and reports whether any visited
/// unit's name is mapped to the target community. The walk is iterative
/// and guards against malformed cyclic chains with a visited set.
pub fn chain_matches_community(
    start: Option<Uuid>,
    orgs: &HashMap<Uuid, OrgNode>,
    mapped_names: &HashSet<String>,
) -> bool {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut current = start;
    while let Some(org_id) = current {
        if !visited.insert(org_id) {
            log::warn!("organization chain contains a cycle at {}", org_id);
            return false;
        }
        let Some(node) = orgs.get(&org_id) else {
            return false;
        };
        if mapped_names.contains(&node.name) {
            return true;
        }
        current = node.parent_id;
    }
    false
}

pub fn load_org_index(conn: &mut PgConnection) -> QueryResult<HashMap<Uuid, OrgNode>> {
    let rows: Vec<Organization> = organizations::table.load(conn)?;
    Ok(rows
        .into_iter()
        .map(|org| {
            (
                org.id,
                OrgNode {
                    name: org.name,
                    parent_id: org.parent_id,
                },
            )
        })
        .collect())
}

pub fn load_mapped_org_names(
    conn: &mut PgConnection,
    community: &str,
) -> QueryResult<HashSet<String>> {
    let mappings: Vec<CommunityOrganization> = community_organizations::table
        .filter(community_organizations::community.eq(community))
        .load(conn)?;
    Ok(mappings.into_iter().map(|m| m.org_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org_tree() -> (HashMap<Uuid, OrgNode>, Uuid, Uuid, Uuid) {
        let root = Uuid::new_v4();
        let branch = Uuid::new_v4();
        let leaf = Uuid::new_v4();
        let mut orgs = HashMap::new();
        orgs.insert(
            root,
            OrgNode {
                name: "east-region".to_string(),
                parent_id: None,
            },
        );
        orgs.insert(
            branch,
            OrgNode {
                name: "riverside-branch".to_string(),
                parent_id: Some(root),
            },
        );
        orgs.insert(
            leaf,
            OrgNode {
                name: "riverside-team-a".to_string(),
                parent_id: Some(branch),
            },
        );
        (orgs, root, branch, leaf)
    }

    #[test]
    fn matches_any_ancestor_in_the_chain() {
        let (orgs, _root, _branch, leaf) = org_tree();
        let mapped: HashSet<String> = ["riverside-branch".to_string()].into_iter().collect();
        assert!(chain_matches_community(Some(leaf), &orgs, &mapped));
    }

    #[test]
    fn no_mapped_ancestor_means_no_match() {
        let (orgs, _root, _branch, leaf) = org_tree();
        let mapped: HashSet<String> = ["west-region".to_string()].into_iter().collect();
        assert!(!chain_matches_community(Some(leaf), &orgs, &mapped));
    }

    #[test]
    fn member_without_organization_never_matches() {
        let (orgs, ..) = org_tree();
        let mapped: HashSet<String> = ["east-region".to_string()].into_iter().collect();
        assert!(!chain_matches_community(None, &orgs, &mapped));
    }

    #[test]
    fn cyclic_chain_terminates_without_match() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut orgs = HashMap::new();
        orgs.insert(
            a,
            OrgNode {
                name: "a".to_string(),
                parent_id: Some(b),
            },
        );
        orgs.insert(
            b,
            OrgNode {
                name: "b".to_string(),
                parent_id: Some(a),
            },
        );
        let mapped: HashSet<String> = ["unrelated".to_string()].into_iter().collect();
        assert!(!chain_matches_community(Some(a), &orgs, &mapped));
    }

    #[test]
    fn dangling_parent_reference_terminates() {
        let a = Uuid::new_v4();
        let missing = Uuid::new_v4();
        let mut orgs = HashMap::new();
        orgs.insert(
            a,
            OrgNode {
                name: "a".to_string(),
                parent_id: Some(missing),
            },
        );
        let mapped: HashSet<String> = ["b".to_string()].into_iter().collect();
        assert!(!chain_matches_community(Some(a), &orgs, &mapped));
    }
}
