//! Arena-backed session map owned by the session manager.

use std::collections::HashMap;

use crate::tmux::TreeRow;

use super::{Pane, Session, Window};

/// Sessions stored in an index arena with an id side map. The active session,
/// when set, always refers to an occupied slot.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    slots: Vec<Option<Session>>,
    free: Vec<usize>,
    by_id: HashMap<String, usize>,
    active: Option<usize>,
}

impl SessionRegistry {
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        let index = *self.by_id.get(id)?;
        self.slots.get(index)?.as_ref()
    }

    /// Insert or replace by id. The first session inserted becomes active.
    pub fn insert(&mut self, session: Session) {
        if let Some(&index) = self.by_id.get(&session.id) {
            self.slots[index] = Some(session);
            return;
        }
        let id = session.id.clone();
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(session);
                index
            }
            None => {
                self.slots.push(Some(session));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, index);
        if self.active.is_none() {
            self.active = Some(index);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let index = self.by_id.remove(id)?;
        let session = self.slots.get_mut(index)?.take();
        self.free.push(index);
        if self.active == Some(index) {
            self.active = self.by_id.values().min().copied();
        }
        session
    }

    pub fn active(&self) -> Option<&Session> {
        self.slots.get(self.active?)?.as_ref()
    }

    pub fn set_active(&mut self, id: &str) -> bool {
        match self.by_id.get(id) {
            Some(&index) => {
                self.active = Some(index);
                true
            }
            None => false,
        }
    }

    /// Sessions ordered by creation time, then id.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.slots.iter().flatten().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Replace the whole map with a fresh listing. Human names given at
    /// creation survive; the active session survives if still present.
    pub fn replace_all(&mut self, sessions: Vec<Session>) {
        let active_id = self.active().map(|s| s.id.clone());
        let names: HashMap<String, String> = self
            .slots
            .iter()
            .flatten()
            .map(|s| (s.id.clone(), s.name.clone()))
            .collect();
        *self = Self::default();
        for mut session in sessions {
            if let Some(name) = names.get(&session.id) {
                session.name = name.clone();
            }
            self.insert(session);
        }
        if let Some(id) = active_id {
            self.set_active(&id);
        }
    }
}

/// Rebuild the session/window/pane tree from pane rows, skipping `hidden`.
///
/// Rows of one session need not be contiguous. Windows and panes come out
/// ordered by index.
pub(crate) fn build_sessions(rows: Vec<TreeRow>, hidden: &str) -> Vec<Session> {
    let mut sessions: Vec<Session> = Vec::new();
    for row in rows {
        if row.session.name == hidden {
            continue;
        }
        let position = match sessions.iter().position(|s| s.id == row.session.name) {
            Some(position) => position,
            None => {
                sessions.push(Session {
                    id: row.session.name.clone(),
                    name: row.session.name.clone(),
                    tmux_id: row.session.tmux_id.clone(),
                    pid: row.session.pid,
                    created_at: row.session.created_unix,
                    attached: row.session.attached,
                    windows: Vec::new(),
                });
                sessions.len() - 1
            }
        };
        let session = &mut sessions[position];
        let window_position = match session.windows.iter().position(|w| w.id == row.window.id) {
            Some(position) => position,
            None => {
                session.windows.push(Window {
                    id: row.window.id.clone(),
                    index: row.window.index,
                    name: row.window.name.clone(),
                    active: row.window.active,
                    panes: Vec::new(),
                });
                session.windows.len() - 1
            }
        };
        let window = &mut session.windows[window_position];
        if window.panes.iter().all(|p| p.id != row.pane_id) {
            window.panes.push(Pane {
                id: row.pane_id,
                index: row.pane_index,
                active: row.pane_active,
                width: row.width,
                height: row.height,
                command: row.command,
                pid: row.pane_pid,
            });
        }
    }
    for session in &mut sessions {
        session.windows.sort_by_key(|w| w.index);
        for window in &mut session.windows {
            window.panes.sort_by_key(|p| p.index);
        }
    }
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::parse_tree;

    fn session(id: &str, created_at: u64) -> Session {
        Session {
            id: id.to_string(),
            name: id.to_string(),
            tmux_id: "$0".to_string(),
            pid: None,
            created_at,
            attached: false,
            windows: Vec::new(),
        }
    }

    #[test]
    fn active_session_always_resolves() {
        let mut registry = SessionRegistry::default();
        registry.insert(session("a-1", 1));
        registry.insert(session("b-2", 2));
        assert_eq!(registry.active().map(|s| s.id.as_str()), Some("a-1"));
        registry.remove("a-1");
        assert_eq!(registry.active().map(|s| s.id.as_str()), Some("b-2"));
        registry.remove("b-2");
        assert!(registry.active().is_none());
        assert!(!registry.set_active("b-2"));
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut registry = SessionRegistry::default();
        registry.insert(session("a-1", 1));
        registry.remove("a-1");
        registry.insert(session("c-3", 3));
        assert_eq!(registry.slots.len(), 1);
        assert!(registry.get("c-3").is_some());
        assert!(registry.get("a-1").is_none());
    }

    #[test]
    fn replace_all_keeps_human_names() {
        let mut registry = SessionRegistry::default();
        let mut created = session("build-1", 1);
        created.name = "Build box".to_string();
        registry.insert(created);
        registry.replace_all(vec![session("build-1", 1), session("other", 5)]);
        assert_eq!(registry.get("build-1").map(|s| s.name.as_str()), Some("Build box"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active().map(|s| s.id.as_str()), Some("build-1"));
    }

    #[test]
    fn tree_is_built_top_down_and_hides_control_session() {
        let text = concat!(
            "s1-1\t$0\t100\t0\t7\t@1\t1\tlogs\t0\t%3\t0\t1\t80\t24\ttail\t30\n",
            "s1-1\t$0\t100\t0\t7\t@0\t0\tmain\t1\t%1\t1\t0\t80\t24\tvim\t11\n",
            "muxctl-control\t$9\t90\t1\t7\t@9\t0\tc\t1\t%9\t0\t1\t80\t24\tbash\t99\n",
            "s1-1\t$0\t100\t0\t7\t@0\t0\tmain\t1\t%0\t0\t1\t80\t24\tbash\t10\n",
        );
        let sessions = build_sessions(parse_tree(text), "muxctl-control");
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.windows.iter().map(|w| w.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(
            s.windows[0].panes.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["%0", "%1"]
        );
        assert_eq!(s.active_pane().map(|p| p.id.as_str()), Some("%0"));
    }
}
