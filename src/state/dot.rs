use crate::state::entity::ValueStore;
use crate::state::graph::{Graph, Transition};
use std::fmt::Write;

const NODE_STYLE: &str = r##"shape=octagon, color="#e53935", fontcolor="#e53935""##;
const EXIT_STYLE: &str = r##"shape=box, color="#7E57C2", fontcolor="#7E57C2""##;
const ACTION_STYLE: &str = "shape=box";
const ENTER_STYLE: &str = r##"shape=box, color="#4caf50", fontcolor="#4caf50""##;

impl<S: ValueStore, R: Send> Graph<S, R> {
    /// Render the graph in Graphviz DOT format.
    ///
    /// Each transition is drawn as a path from its source node through the
    /// exit hook, the transition's actions and the destination's enter hook.
    /// Hooks suppressed by an internal self-transition are omitted.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph Machines {\n");

        for id in &self.order {
            let _ = writeln!(out, "  {} [{}];", quote(id), NODE_STYLE);
        }

        for id in &self.order {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };

            for (j, t) in node.transitions.iter().enumerate() {
                let internal = t.internal && t.destination == node.id;
                let mut path = j.to_string();
                let mut prev = node.id.clone();

                if let (Some(exit), false) = (&node.on_exit, internal) {
                    let name = format!("{}{}{}", exit.label(), node.id, path);
                    add_box(&mut out, &name, &exit.label(), EXIT_STYLE);
                    add_edge(&mut out, &prev, &name, Some(&edge_label(t)));
                    prev = name;
                }

                for (k, action) in t.actions.iter().enumerate() {
                    path.push_str(&k.to_string());
                    let name = format!("{}{}{}", action.label(), node.id, path);
                    add_box(&mut out, &name, &action.label(), ACTION_STYLE);
                    let label = (prev == node.id).then(|| edge_label(t));
                    add_edge(&mut out, &prev, &name, label.as_deref());
                    prev = name;
                }

                let enter = self
                    .nodes
                    .get(&t.destination)
                    .and_then(|d| d.on_enter.as_ref());

                if let (Some(enter), false) = (enter, internal) {
                    let name = format!("{}{}{}", enter.label(), node.id, path);
                    add_box(&mut out, &name, &enter.label(), ENTER_STYLE);
                    let label = (prev == node.id).then(|| edge_label(t));
                    add_edge(&mut out, &prev, &name, label.as_deref());
                    prev = name;
                }

                let label = (prev == node.id).then(|| edge_label(t));
                add_edge(&mut out, &prev, &t.destination, label.as_deref());
            }
        }

        out.push_str("}\n");
        out
    }
}

fn edge_label<S, R>(t: &Transition<S, R>) -> String {
    format!("Key {} Value: {}", t.trigger_key, t.trigger)
}

fn add_box(out: &mut String, name: &str, label: &str, style: &str) {
    let _ = writeln!(out, "  {} [{}, label={}];", quote(name), style, quote(label));
}

fn add_edge(out: &mut String, from: &str, to: &str, label: Option<&str>) {
    match label {
        Some(label) => {
            let _ = writeln!(out, "  {} -> {} [label={}];", quote(from), quote(to), quote(label));
        }
        None => {
            let _ = writeln!(out, "  {} -> {};", quote(from), quote(to));
        }
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}
