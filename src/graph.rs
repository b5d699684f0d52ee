//! Conversation Graph (component C): a per-session DAG of turns with
//! temporal and semantic edges, used for trajectory ("boiling frog")
//! detection. Grounded on
//! `original_source/src/layer2/graph_memory.py::ConversationGraph`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::vector::cosine_similarity;

const SEMANTIC_LOOKBACK: usize = 5;
const SEMANTIC_EDGE_THRESHOLD: f32 = 0.5;
const ESCALATION_RISK_FLOOR: i32 = 20;

#[derive(Debug, Clone)]
pub struct TurnNode {
    pub id: usize,
    pub prompt: String,
    pub vector: Vec<f32>,
    pub risk: i32,
    pub reason: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryStatus {
    Stable,
    Escalating,
}

impl TrajectoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrajectoryStatus::Stable => "stable",
            TrajectoryStatus::Escalating => "escalating",
        }
    }
}

#[derive(Debug)]
struct Edge {
    from: usize,
    to: usize,
    #[allow(dead_code)]
    weight: f32,
}

/// Single-session conversation graph. Not thread-safe on its own; the
/// orchestrator serializes access per pipeline.
#[derive(Default)]
pub struct ConversationGraph {
    nodes: Vec<TurnNode>,
    edges: Vec<Edge>,
}

impl ConversationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a new node, wires the temporal edge to `id-1`, and wires
    /// semantic edges to any of the last `SEMANTIC_LOOKBACK` nodes whose
    /// cosine similarity exceeds the threshold. Returns the new node id.
    pub fn add_interaction(&mut self, prompt: String, vector: Vec<f32>, risk: i32, reason: String) -> usize {
        let id = self.nodes.len();
        let time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        if id > 0 {
            self.edges.push(Edge {
                from: id - 1,
                to: id,
                weight: 1.0,
            });
        }

        let start = id.saturating_sub(SEMANTIC_LOOKBACK);
        for prev_id in start..id {
            let sim = cosine_similarity(&vector, &self.nodes[prev_id].vector);
            if sim > SEMANTIC_EDGE_THRESHOLD {
                self.edges.push(Edge {
                    from: prev_id,
                    to: id,
                    weight: sim,
                });
            }
        }

        self.nodes.push(TurnNode {
            id,
            prompt,
            vector,
            risk,
            reason,
            time_ms,
        });
        id
    }

    /// Looks at the risk of the last 3 turns; escalating if the most recent
    /// risk exceeds both the previous turn's risk and the escalation floor.
    pub fn detect_trajectory(&self) -> (TrajectoryStatus, i32) {
        if self.nodes.len() < 3 {
            return (TrajectoryStatus::Stable, 0);
        }
        let n = self.nodes.len();
        let r = [self.nodes[n - 3].risk, self.nodes[n - 2].risk, self.nodes[n - 1].risk];
        if r[2] > r[1] && r[2] > ESCALATION_RISK_FLOOR {
            (TrajectoryStatus::Escalating, r[2] - r[1])
        } else {
            (TrajectoryStatus::Stable, 0)
        }
    }

    /// Last `limit` prompts as `"Turn i: <prompt>"` lines, without risk
    /// scores — the judge must re-evaluate independently.
    pub fn get_context_str(&self, limit: usize) -> String {
        let n = self.nodes.len();
        let start = n.saturating_sub(limit);
        self.nodes[start..n]
            .iter()
            .map(|node| format!("Turn {}: {}", node.id + 1, node.prompt))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn reset(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    #[cfg(test)]
    fn edge_exists(&self, from: usize, to: usize) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32) -> Vec<f32> {
        vec![x, 1.0 - x]
    }

    #[test]
    fn ids_increase_monotonically() {
        let mut g = ConversationGraph::new();
        let a = g.add_interaction("one".into(), v(0.1), 0, "".into());
        let b = g.add_interaction("two".into(), v(0.2), 0, "".into());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn temporal_edge_always_present() {
        let mut g = ConversationGraph::new();
        g.add_interaction("one".into(), v(0.1), 0, "".into());
        g.add_interaction("two".into(), v(0.1), 0, "".into());
        assert!(g.edge_exists(0, 1));
    }

    #[test]
    fn fewer_than_three_nodes_is_stable() {
        let mut g = ConversationGraph::new();
        g.add_interaction("a".into(), v(0.1), 90, "".into());
        g.add_interaction("b".into(), v(0.1), 90, "".into());
        let (status, delta) = g.detect_trajectory();
        assert_eq!(status, TrajectoryStatus::Stable);
        assert_eq!(delta, 0);
    }

    #[test]
    fn rising_risk_above_floor_is_escalating() {
        let mut g = ConversationGraph::new();
        g.add_interaction("tell me about networking".into(), v(0.1), 5, "".into());
        g.add_interaction("now how would an attacker escalate".into(), v(0.2), 15, "".into());
        g.add_interaction("give me a working exploit".into(), v(0.3), 85, "".into());
        let (status, delta) = g.detect_trajectory();
        assert_eq!(status, TrajectoryStatus::Escalating);
        assert_eq!(delta, 70);
    }

    #[test]
    fn context_str_omits_risk_scores() {
        let mut g = ConversationGraph::new();
        g.add_interaction("hello".into(), v(0.1), 99, "BLOCK: whatever".into());
        let ctx = g.get_context_str(5);
        assert_eq!(ctx, "Turn 1: hello");
        assert!(!ctx.contains("99"));
    }

    #[test]
    fn reset_clears_all_state() {
        let mut g = ConversationGraph::new();
        g.add_interaction("a".into(), v(0.1), 0, "".into());
        g.reset();
        assert!(g.is_empty());
        assert_eq!(g.len(), 0);
    }
}
