use crate::graph::{DepFlags, Graph, NodeId};

/// Recomputes the dev, optional, dev optional, peer and extraneous flags of every node in a tree.
///
/// Flags start set everywhere except the root and are cleared along edges until nothing changes,
/// so a node keeps a flag only if every path reaching it carries that flag. Nodes no edge reaches
/// stay extraneous. Links pass their flags on to their target.
pub fn fix_dep_flags(graph: &mut Graph, root: NodeId) {
	let nodes = graph.tree_nodes(root);
	for id in &nodes {
		graph.node_mut(*id).flags = if *id == root { DepFlags::none() } else { DepFlags::all() };
	}

	let mut changed = true;
	let mut passes = 0;
	while changed {
		changed = false;
		passes += 1;
		for id in &nodes {
			let from = graph.node(*id).flags;
			if from.extraneous {
				continue;
			}
			let mut targets = Vec::new();
			if let Some(t) = graph.node(*id).target() {
				targets.push((t, from));
			}
			for e in graph.node(*id).edges_out().values() {
				let edge = graph.edge(*e);
				let to = match edge.to() {
					Some(to) => to,
					None => continue,
				};
				let unset_dev_opt = !from.dev_optional && !from.dev && !from.optional && !edge.dev() && !edge.optional();
				let wanted = DepFlags {
					dev: !(unset_dev_opt || (!from.dev && !edge.dev())),
					optional: !(unset_dev_opt || (!from.optional && !edge.optional())),
					dev_optional: !unset_dev_opt,
					peer: from.peer || edge.peer(),
					extraneous: false,
				};
				targets.push((to, wanted));
			}
			for (to, wanted) in targets {
				if graph.node(to).root() != root {
					continue;
				}
				let current = graph.node(to).flags;
				let next = DepFlags {
					dev: current.dev && wanted.dev,
					optional: current.optional && wanted.optional,
					dev_optional: current.dev_optional && wanted.dev_optional,
					peer: current.peer && wanted.peer,
					extraneous: current.extraneous && wanted.extraneous,
				};
				if next != current {
					graph.node_mut(to).flags = next;
					changed = true;
				}
			}
		}
	}
	log::trace!("Dependency flags settled after {} passes", passes);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::NodeOptions;
	use crate::Manifest;

	#[test]
	fn flags_follow_edge_types() {
		let mut g = Graph::new();
		let root = g.create_root(
			Manifest::new("root", "1.0.0").dep("p", "1").dev_dep("d", "1").optional_dep("o", "1"),
			"/p",
		).unwrap();
		let p = g.create_node(NodeOptions::new(Manifest::new("p", "1.0.0").dep("shared", "1")).parent(root)).unwrap();
		let d = g.create_node(NodeOptions::new(Manifest::new("d", "1.0.0").dep("shared", "1").dep("devonly", "1")).parent(root)).unwrap();
		let o = g.create_node(NodeOptions::new(Manifest::new("o", "1.0.0")).parent(root)).unwrap();
		let shared = g.create_node(NodeOptions::new(Manifest::new("shared", "1.0.0")).parent(root)).unwrap();
		let devonly = g.create_node(NodeOptions::new(Manifest::new("devonly", "1.0.0")).parent(root)).unwrap();
		let stray = g.create_node(NodeOptions::new(Manifest::new("stray", "1.0.0")).parent(root)).unwrap();

		fix_dep_flags(&mut g, root);

		assert_eq!(g.node(root).flags, DepFlags::none());
		assert!(!g.node(p).flags.dev && !g.node(p).flags.optional);
		assert!(g.node(d).flags.dev && !g.node(d).flags.optional);
		assert!(g.node(o).flags.optional && !g.node(o).flags.dev);
		assert_eq!(g.node(shared).flags, DepFlags::none());
		assert!(g.node(devonly).flags.dev);
		assert!(g.node(stray).flags.extraneous);
	}

	#[test]
	fn dev_optional_is_the_overlap() {
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dev_dep("d", "1").optional_dep("o", "1"), "/p").unwrap();
		g.create_node(NodeOptions::new(Manifest::new("d", "1.0.0").dep("x", "1")).parent(root)).unwrap();
		g.create_node(NodeOptions::new(Manifest::new("o", "1.0.0").dep("x", "1")).parent(root)).unwrap();
		let x = g.create_node(NodeOptions::new(Manifest::new("x", "1.0.0")).parent(root)).unwrap();
		fix_dep_flags(&mut g, root);
		let flags = g.node(x).flags;
		assert!(!flags.dev && !flags.optional && flags.dev_optional);
	}
}
