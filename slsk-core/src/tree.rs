//! Host-driven distributed tree: the host feeds parent/child/server events in and
//! executes the returned actions. No I/O happens here.

use std::collections::BTreeSet;

use crate::distributed::DistributedMessage;
use crate::server::{ParentCandidate, ServerRequest};
use crate::wire::DecodeError;

/// Default cap on parent candidates tried per PossibleParents list.
pub const DEFAULT_MAX_PARENT_ATTEMPTS: usize = 3;

/// Default cap on registered children.
pub const DEFAULT_MAX_CHILDREN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    NoParent,
    AcquiringParent,
    HasParent,
}

/// Work for the host to carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeAction {
    SendToServer(ServerRequest),
    SendToChildren(DistributedMessage),
    SendToChild(String, DistributedMessage),
    /// Dial these candidates in order, stopping at the first success.
    ConnectParents(Vec<ParentCandidate>),
    DisconnectParent(String),
    DisconnectChild(String),
    /// Match `query` against local shares and answer `username`.
    LocalSearch {
        username: String,
        token: u32,
        query: String,
    },
}

#[derive(Debug)]
pub struct DistributedTree {
    own_username: String,
    state: TreeState,
    parent: Option<String>,
    level: Option<u32>,
    root: Option<String>,
    /// Last (level, root) pushed to children, so repeats are not re-sent.
    propagated: Option<(u32, String)>,
    children: BTreeSet<String>,
    accepting_children: bool,
    max_children: usize,
    max_parent_attempts: usize,
}

impl DistributedTree {
    pub fn new(own_username: impl Into<String>) -> Self {
        Self::with_limits(own_username, DEFAULT_MAX_CHILDREN, DEFAULT_MAX_PARENT_ATTEMPTS)
    }

    pub fn with_limits(
        own_username: impl Into<String>,
        max_children: usize,
        max_parent_attempts: usize,
    ) -> Self {
        Self {
            own_username: own_username.into(),
            state: TreeState::NoParent,
            parent: None,
            level: None,
            root: None,
            propagated: None,
            children: BTreeSet::new(),
            accepting_children: true,
            max_children,
            max_parent_attempts,
        }
    }

    pub fn own_username(&self) -> &str {
        &self.own_username
    }

    pub fn state(&self) -> TreeState {
        self.state
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn branch_level(&self) -> Option<u32> {
        self.level
    }

    pub fn branch_root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn children(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(String::as_str)
    }

    pub fn accepting_children(&self) -> bool {
        self.accepting_children
    }

    /// Server offered parent candidates. Ignored unless we are parentless.
    pub fn on_possible_parents(&mut self, candidates: &[ParentCandidate]) -> Vec<TreeAction> {
        if self.state != TreeState::NoParent {
            return Vec::new();
        }
        let picked: Vec<ParentCandidate> = candidates
            .iter()
            .filter(|c| c.username != self.own_username)
            .take(self.max_parent_attempts)
            .cloned()
            .collect();
        if picked.is_empty() {
            return Vec::new();
        }
        self.state = TreeState::AcquiringParent;
        vec![TreeAction::ConnectParents(picked)]
    }

    /// One of the candidates accepted our distributed connection.
    pub fn on_parent_connected(&mut self, username: &str) -> Vec<TreeAction> {
        if self.state != TreeState::AcquiringParent {
            tracing::debug!(username, "parent connection arrived while not acquiring; closing");
            return vec![TreeAction::DisconnectParent(username.to_owned())];
        }
        let mut actions = Vec::new();
        if let Some(stale) = self.parent.take() {
            actions.push(TreeAction::DisconnectParent(stale));
        }
        self.parent = Some(username.to_owned());
        self.state = TreeState::HasParent;
        self.clear_branch();
        actions.push(TreeAction::SendToServer(ServerRequest::HaveNoParent(false)));
        actions
    }

    /// Every candidate from the last list failed.
    pub fn on_parent_attempts_failed(&mut self) -> Vec<TreeAction> {
        if self.state != TreeState::AcquiringParent {
            return Vec::new();
        }
        self.state = TreeState::NoParent;
        vec![TreeAction::SendToServer(ServerRequest::HaveNoParent(true))]
    }

    pub fn on_parent_disconnected(&mut self, username: &str) -> Vec<TreeAction> {
        if self.parent.as_deref() != Some(username) {
            return Vec::new();
        }
        self.parent = None;
        self.state = TreeState::NoParent;
        self.clear_branch();
        vec![TreeAction::SendToServer(ServerRequest::HaveNoParent(true))]
    }

    /// Server asked us to rebuild our position in the tree.
    pub fn on_reset(&mut self) -> Vec<TreeAction> {
        let mut actions = Vec::new();
        if let Some(parent) = self.parent.take() {
            actions.push(TreeAction::DisconnectParent(parent));
        }
        self.state = TreeState::NoParent;
        self.clear_branch();
        actions.push(TreeAction::SendToServer(ServerRequest::HaveNoParent(true)));
        actions
    }

    /// Parent reported its own level.
    pub fn on_branch_level(&mut self, parent_level: u32) -> Vec<TreeAction> {
        let our_level = parent_level.saturating_add(1);
        self.level = Some(our_level);
        let mut actions = vec![TreeAction::SendToServer(ServerRequest::BranchLevel(our_level))];
        if parent_level == 0 {
            if let Some(parent) = self.parent.clone() {
                actions.push(TreeAction::SendToServer(ServerRequest::BranchRoot(
                    parent.clone(),
                )));
                self.root = Some(parent);
            }
        }
        actions.extend(self.propagate());
        actions
    }

    /// Parent reported the root of our branch.
    pub fn on_branch_root(&mut self, root: String) -> Vec<TreeAction> {
        let mut actions = vec![TreeAction::SendToServer(ServerRequest::BranchRoot(
            root.clone(),
        ))];
        self.root = Some(root);
        actions.extend(self.propagate());
        actions
    }

    pub fn on_child_connected(&mut self, username: &str) -> Vec<TreeAction> {
        let is_new = !self.children.contains(username);
        if username == self.own_username || (is_new && self.children.len() >= self.max_children) {
            return vec![TreeAction::DisconnectChild(username.to_owned())];
        }
        self.children.insert(username.to_owned());
        let mut actions = Vec::new();
        if let Some(level) = self.level {
            actions.push(TreeAction::SendToChild(
                username.to_owned(),
                DistributedMessage::BranchLevel(level),
            ));
        }
        if let Some(root) = &self.root {
            actions.push(TreeAction::SendToChild(
                username.to_owned(),
                DistributedMessage::BranchRoot(root.clone()),
            ));
        }
        if self.children.len() >= self.max_children && self.accepting_children {
            self.accepting_children = false;
            actions.push(TreeAction::SendToServer(ServerRequest::AcceptChildren(false)));
        }
        actions
    }

    pub fn on_child_disconnected(&mut self, username: &str) -> Vec<TreeAction> {
        if !self.children.remove(username) {
            return Vec::new();
        }
        if self.children.len() < self.max_children && !self.accepting_children {
            self.accepting_children = true;
            return vec![TreeAction::SendToServer(ServerRequest::AcceptChildren(true))];
        }
        Vec::new()
    }

    /// A child reported the depth of its own subtree.
    pub fn on_child_depth(&mut self, depth: u32) -> Vec<TreeAction> {
        vec![TreeAction::SendToServer(ServerRequest::ChildDepth(
            depth.saturating_add(1),
        ))]
    }

    /// Fan a search out: children first, then a local match unless we asked it ourselves.
    pub fn on_search_request(
        &mut self,
        unknown: u32,
        username: String,
        token: u32,
        query: String,
    ) -> Vec<TreeAction> {
        let mut actions = Vec::new();
        if !self.children.is_empty() {
            actions.push(TreeAction::SendToChildren(
                DistributedMessage::SearchRequest {
                    unknown,
                    username: username.clone(),
                    token,
                    query: query.clone(),
                },
            ));
        }
        if username != self.own_username {
            actions.push(TreeAction::LocalSearch {
                username,
                token,
                query,
            });
        }
        actions
    }

    /// Server relayed a distributed message to us as a branch root.
    pub fn on_embedded_message(
        &mut self,
        code: u8,
        payload: &[u8],
    ) -> Result<Vec<TreeAction>, DecodeError> {
        let inner = DistributedMessage::unwrap_embedded(code, payload)?;
        let mut actions = Vec::new();
        if self.parent.is_none() && self.level != Some(0) {
            // Only a branch root receives embedded messages.
            self.level = Some(0);
            self.root = Some(self.own_username.clone());
            actions.push(TreeAction::SendToServer(ServerRequest::BranchLevel(0)));
            actions.push(TreeAction::SendToServer(ServerRequest::BranchRoot(
                self.own_username.clone(),
            )));
            actions.extend(self.propagate());
        }
        match inner {
            DistributedMessage::SearchRequest {
                unknown,
                username,
                token,
                query,
            } => actions.extend(self.on_search_request(unknown, username, token, query)),
            other => {
                tracing::debug!(code = other.code() as u8, "ignoring embedded non-search message");
            }
        }
        Ok(actions)
    }

    /// Route a message read from the parent connection.
    pub fn on_parent_message(&mut self, msg: DistributedMessage) -> Result<Vec<TreeAction>, DecodeError> {
        Ok(match msg {
            DistributedMessage::Ping | DistributedMessage::ChildDepth(_) => Vec::new(),
            DistributedMessage::SearchRequest {
                unknown,
                username,
                token,
                query,
            } => self.on_search_request(unknown, username, token, query),
            DistributedMessage::BranchLevel(level) => self.on_branch_level(level),
            DistributedMessage::BranchRoot(root) => self.on_branch_root(root),
            DistributedMessage::EmbeddedMessage { code, payload } => {
                return self.on_embedded_message(code, &payload)
            }
        })
    }

    fn clear_branch(&mut self) {
        self.level = None;
        self.root = None;
        self.propagated = None;
    }

    fn propagate(&mut self) -> Vec<TreeAction> {
        let (Some(level), Some(root)) = (self.level, self.root.clone()) else {
            return Vec::new();
        };
        if self.propagated.as_ref() == Some(&(level, root.clone())) {
            return Vec::new();
        }
        self.propagated = Some((level, root.clone()));
        if self.children.is_empty() {
            return Vec::new();
        }
        vec![
            TreeAction::SendToChildren(DistributedMessage::BranchLevel(level)),
            TreeAction::SendToChildren(DistributedMessage::BranchRoot(root)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;

    fn candidate(name: &str) -> ParentCandidate {
        ParentCandidate {
            username: name.into(),
            ip: Ipv4Addr::new(10, 0, 0, 1),
            port: 2234,
        }
    }

    fn with_parent(parent: &str) -> DistributedTree {
        let mut tree = DistributedTree::new("me");
        tree.on_possible_parents(&[candidate(parent)]);
        tree.on_parent_connected(parent);
        tree
    }

    /// Expand fan-out actions into per-child deliveries.
    fn deliveries(tree: &DistributedTree, actions: &[TreeAction]) -> HashMap<String, Vec<DistributedMessage>> {
        let mut out: HashMap<String, Vec<DistributedMessage>> = HashMap::new();
        for action in actions {
            match action {
                TreeAction::SendToChildren(msg) => {
                    for child in tree.children() {
                        out.entry(child.to_owned()).or_default().push(msg.clone());
                    }
                }
                TreeAction::SendToChild(child, msg) => {
                    out.entry(child.clone()).or_default().push(msg.clone());
                }
                _ => {}
            }
        }
        out
    }

    #[test]
    fn parent_acquisition_takes_three_skipping_self() {
        let mut tree = DistributedTree::new("me");
        let list = ["a", "me", "b", "c", "d"].map(candidate);
        let actions = tree.on_possible_parents(&list);
        let [TreeAction::ConnectParents(picked)] = actions.as_slice() else {
            panic!("expected ConnectParents, got {actions:?}");
        };
        let names: Vec<_> = picked.iter().map(|c| c.username.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(tree.state(), TreeState::AcquiringParent);
        // A second list while acquiring is ignored.
        assert!(tree.on_possible_parents(&list).is_empty());
    }

    #[test]
    fn parent_connected_reports_to_server() {
        let mut tree = DistributedTree::new("me");
        tree.on_possible_parents(&[candidate("p")]);
        let actions = tree.on_parent_connected("p");
        assert_eq!(
            actions,
            vec![TreeAction::SendToServer(ServerRequest::HaveNoParent(false))]
        );
        assert_eq!(tree.state(), TreeState::HasParent);
        assert_eq!(tree.parent(), Some("p"));
        assert!(tree.on_possible_parents(&[candidate("q")]).is_empty());
    }

    #[test]
    fn unexpected_parent_connection_is_closed() {
        let mut tree = with_parent("p");
        assert_eq!(
            tree.on_parent_connected("late"),
            vec![TreeAction::DisconnectParent("late".into())]
        );
        assert_eq!(tree.parent(), Some("p"));
    }

    #[test]
    fn failed_attempts_return_to_no_parent() {
        let mut tree = DistributedTree::new("me");
        tree.on_possible_parents(&[candidate("p")]);
        assert_eq!(
            tree.on_parent_attempts_failed(),
            vec![TreeAction::SendToServer(ServerRequest::HaveNoParent(true))]
        );
        assert_eq!(tree.state(), TreeState::NoParent);
        assert!(!tree.on_possible_parents(&[candidate("p")]).is_empty());
    }

    #[test]
    fn branch_info_reaches_each_child_exactly_once() {
        let mut tree = with_parent("p");
        tree.on_child_connected("c1");
        tree.on_child_connected("c2");
        let mut actions = tree.on_branch_level(3);
        assert!(actions.contains(&TreeAction::SendToServer(ServerRequest::BranchLevel(4))));
        actions.extend(tree.on_branch_root("alice".into()));
        // Repeats from the parent change nothing.
        actions.extend(tree.on_branch_root("alice".into()));
        let got = deliveries(&tree, &actions);
        for child in ["c1", "c2"] {
            assert_eq!(
                got[child],
                vec![
                    DistributedMessage::BranchLevel(4),
                    DistributedMessage::BranchRoot("alice".into())
                ],
                "child {child}"
            );
        }
        assert_eq!(tree.branch_level(), Some(4));
        assert_eq!(tree.branch_root(), Some("alice"));
    }

    #[test]
    fn parent_at_level_zero_is_root() {
        let mut tree = with_parent("rootuser");
        tree.on_child_connected("c");
        let actions = tree.on_branch_level(0);
        assert!(actions.contains(&TreeAction::SendToServer(ServerRequest::BranchLevel(1))));
        assert!(actions.contains(&TreeAction::SendToServer(ServerRequest::BranchRoot(
            "rootuser".into()
        ))));
        assert_eq!(
            deliveries(&tree, &actions)["c"],
            vec![
                DistributedMessage::BranchLevel(1),
                DistributedMessage::BranchRoot("rootuser".into())
            ]
        );
    }

    #[test]
    fn new_child_gets_current_branch() {
        let mut tree = with_parent("p");
        tree.on_branch_level(0);
        assert_eq!(
            tree.on_child_connected("late"),
            vec![
                TreeAction::SendToChild("late".into(), DistributedMessage::BranchLevel(1)),
                TreeAction::SendToChild("late".into(), DistributedMessage::BranchRoot("p".into())),
            ]
        );
    }

    #[test]
    fn search_forwards_before_local_match() {
        let mut tree = with_parent("p");
        tree.on_child_connected("c");
        let actions = tree.on_search_request(0x31, "bob".into(), 5, "query".into());
        assert_eq!(
            actions,
            vec![
                TreeAction::SendToChildren(DistributedMessage::search("bob", 5, "query")),
                TreeAction::LocalSearch {
                    username: "bob".into(),
                    token: 5,
                    query: "query".into()
                },
            ]
        );
    }

    #[test]
    fn own_search_not_answered_locally() {
        let mut tree = with_parent("p");
        tree.on_child_connected("c");
        let actions = tree.on_search_request(0x31, "me".into(), 5, "query".into());
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], TreeAction::SendToChildren(_)));
    }

    #[test]
    fn children_capacity_toggles_accept_children() {
        let mut tree = DistributedTree::with_limits("me", 2, 3);
        assert!(tree.on_child_connected("a").is_empty());
        assert_eq!(
            tree.on_child_connected("b"),
            vec![TreeAction::SendToServer(ServerRequest::AcceptChildren(false))]
        );
        assert_eq!(
            tree.on_child_connected("c"),
            vec![TreeAction::DisconnectChild("c".into())]
        );
        assert_eq!(
            tree.on_child_disconnected("a"),
            vec![TreeAction::SendToServer(ServerRequest::AcceptChildren(true))]
        );
        assert!(tree.on_child_disconnected("a").is_empty());
        assert_eq!(tree.children().collect::<Vec<_>>(), ["b"]);
    }

    #[test]
    fn child_disconnect_leaves_parent_and_siblings() {
        let mut tree = with_parent("p");
        tree.on_child_connected("a");
        tree.on_child_connected("b");
        tree.on_child_disconnected("a");
        assert_eq!(tree.parent(), Some("p"));
        assert_eq!(tree.children().collect::<Vec<_>>(), ["b"]);
    }

    #[test]
    fn reset_tears_down_parent() {
        let mut tree = with_parent("p");
        tree.on_branch_level(2);
        let actions = tree.on_reset();
        assert_eq!(
            actions,
            vec![
                TreeAction::DisconnectParent("p".into()),
                TreeAction::SendToServer(ServerRequest::HaveNoParent(true)),
            ]
        );
        assert_eq!(tree.state(), TreeState::NoParent);
        assert_eq!(tree.branch_level(), None);
    }

    #[test]
    fn parent_disconnect_clears_branch() {
        let mut tree = with_parent("p");
        tree.on_branch_level(0);
        assert!(tree.on_parent_disconnected("other").is_empty());
        assert_eq!(
            tree.on_parent_disconnected("p"),
            vec![TreeAction::SendToServer(ServerRequest::HaveNoParent(true))]
        );
        assert_eq!(tree.branch_root(), None);
    }

    #[test]
    fn embedded_search_makes_us_root() {
        let mut tree = DistributedTree::new("me");
        tree.on_child_connected("c");
        let inner = DistributedMessage::search("bob", 8, "q");
        let actions = tree.on_embedded_message(3, &inner.payload()).unwrap();
        assert_eq!(tree.branch_level(), Some(0));
        assert_eq!(tree.branch_root(), Some("me"));
        let got = deliveries(&tree, &actions);
        assert_eq!(
            got["c"],
            vec![
                DistributedMessage::BranchLevel(0),
                DistributedMessage::BranchRoot("me".into()),
                inner,
            ]
        );
        assert!(actions.iter().any(|a| matches!(a, TreeAction::LocalSearch { token: 8, .. })));
    }

    #[test]
    fn malformed_embedded_message_is_error() {
        let mut tree = DistributedTree::new("me");
        assert!(tree.on_embedded_message(3, &[1, 2]).is_err());
    }
}
