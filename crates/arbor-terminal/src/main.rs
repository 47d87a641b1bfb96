use std::path::Path;
use std::sync::Arc;

use arbor::config::InstallStrategy;
use arbor::diff::{Action, Diff};
use arbor::graph::EdgeType;
use arbor::ideal_tree::IdealTreeBuilder;
use arbor::registry::{NoopScripts, RegistryFetcher, TarballExtractor};
use arbor::reify::Reifier;
use arbor::{ArborOptions, Graph, NodeId};

#[tokio::main]
async fn main() {
	env_logger::init();

	let mut opts;

	/* Parse console input */
	let parsed_options = {
		let args: Vec<String> = std::env::args().collect();

		opts = getopts::Options::new();
		opts.optflag("h", "help", "Show help");
		opts.optopt("C", "config", "Read options from a JSON file", "FILE");
		opts.optopt("", "registry", "Registry base url", "URL");
		opts.optopt("", "strategy", "Install strategy: hoisted, nested or shallow", "STRATEGY");
		opts.optmulti("", "omit", "Dependency type to leave off disk: dev, optional or peer", "TYPE");
		opts.optflag("", "save-dev", "Add requested packages as dev dependencies");
		opts.optflag("", "force", "Accept broken placements instead of failing");
		opts.optflag("", "legacy-peer-deps", "Ignore peer dependencies");
		opts.optflag("", "strict-peer-deps", "Fail on any peer dependency conflict");
		opts.optflag("", "prefer-dedupe", "Keep existing compatible packages over newer ones");
		opts.optflag("", "strict", "Check tree invariants after building");
		opts.optflag("", "no-save", "Don't write the lockfile");
		opts.parsing_style(getopts::ParsingStyle::FloatingFrees);

		let parsed_options = match opts.parse(&args[1..]) {
			Ok(m) => m,
			Err(e) => { println!("Unable to parse options: {}", e); return },
		};

		if parsed_options.opt_present("h") || parsed_options.free.is_empty() {
			eprintln!("{}", opts.usage("Usage: arbor-terminal [options] <ideal|diff|install|verify> [package@spec...]"));
			return;
		}

		parsed_options
	};

	let options = match build_options(&parsed_options) {
		Ok(o) => o,
		Err(e) => { log::error!("{}", e); return },
	};

	let command = parsed_options.free[0].as_str();
	let packages = &parsed_options.free[1..];
	let result = match command {
		"ideal" => print_ideal(&options, packages, parsed_options.opt_present("save-dev")).await,
		"diff" => print_diff(&options, packages, parsed_options.opt_present("save-dev")).await,
		"install" => install(&options, packages, parsed_options.opt_present("save-dev")).await,
		"verify" => verify(&options),
		other => Err(Error::UnknownCommand(other.to_string())),
	};
	if let Err(e) = result {
		log::error!("{} failed: {}", command, e);
		std::process::exit(1);
	}
}

fn build_options(parsed: &getopts::Matches) -> Result<ArborOptions, Error> {
	let cwd = std::env::current_dir().map_err(arbor::Error::from)?;
	let mut options = match parsed.opt_str("config") {
		Some(path) => {
			let mut options = ArborOptions::load_from_file(&path)?;
			if options.path().is_relative() {
				options.set_path(cwd.join(options.path()));
			}
			options
		},
		None => ArborOptions::new(cwd),
	};

	if let Some(registry) = parsed.opt_str("registry") {
		options.set_registry(registry);
	}
	if let Some(strategy) = parsed.opt_str("strategy") {
		options.set_install_strategy(match strategy.as_str() {
			"hoisted" => InstallStrategy::Hoisted,
			"nested" => InstallStrategy::Nested,
			"shallow" => InstallStrategy::Shallow,
			_ => return Err(Error::InvalidArgument(strategy)),
		});
	}
	let mut omit = Vec::new();
	for t in parsed.opt_strs("omit") {
		omit.push(match t.as_str() {
			"dev" => EdgeType::Dev,
			"optional" => EdgeType::Optional,
			"peer" => EdgeType::Peer,
			_ => return Err(Error::InvalidArgument(t)),
		});
	}
	if !omit.is_empty() {
		options.set_omit(omit);
	}
	options.set_force(options.force() || parsed.opt_present("force"));
	options.set_legacy_peer_deps(options.legacy_peer_deps() || parsed.opt_present("legacy-peer-deps"));
	options.set_strict_peer_deps(options.strict_peer_deps() || parsed.opt_present("strict-peer-deps"));
	options.set_prefer_dedupe(options.prefer_dedupe() || parsed.opt_present("prefer-dedupe"));
	options.set_strict(options.strict() || parsed.opt_present("strict"));
	if parsed.opt_present("no-save") {
		options.set_save(false);
	}
	Ok(options)
}

/// Splits `name@spec`, scoped names keep their leading `@`.
fn split_request(request: &str) -> (String, String) {
	match request.char_indices().skip(1).find(|(_, c)| *c == '@') {
		Some((i, _)) => (request[..i].to_string(), request[i + 1..].to_string()),
		None => (request.to_string(), String::from("*")),
	}
}

async fn ideal(options: &ArborOptions, graph: &mut Graph, packages: &[String], dev: bool) -> Result<NodeId, Error> {
	let fetcher = Arc::new(RegistryFetcher::new(options).map_err(arbor::Error::from)?);
	let edge_type = if dev { EdgeType::Dev } else { EdgeType::Prod };
	let mut builder = IdealTreeBuilder::new(options.clone(), fetcher);
	for request in packages {
		let (name, spec) = split_request(request);
		builder = builder.add(name, spec, edge_type);
	}
	let ideal = builder.build(graph).await?;
	for edge in &ideal.peer_conflicts {
		println!("warning: conflicting peer dependency {}", graph.edge(*edge));
	}
	Ok(ideal.root)
}

async fn print_ideal(options: &ArborOptions, packages: &[String], dev: bool) -> Result<(), Error> {
	let mut graph = Graph::new();
	let root = ideal(options, &mut graph, packages, dev).await?;
	for (location, entry) in graph.snapshot(root).entries {
		if location.is_empty() {
			continue;
		}
		match (&entry.link_target, &entry.version) {
			(Some(target), _) => println!("{} -> {}", location, target),
			(None, Some(version)) => println!("{} {}", location, version),
			(None, None) => println!("{}", location),
		}
	}
	Ok(())
}

fn print_changes(graph: &Graph, diff: &Diff, base: &Path) {
	for leaf in &diff.leaves {
		let node = diff.node(*leaf);
		let action = match node.action {
			Some(a) => a,
			None => continue,
		};
		let shown = node.path.strip_prefix(base).unwrap_or(&node.path);
		let version = match action {
			Action::Remove => node.actual,
			_ => node.ideal,
		}.and_then(|n| graph.node(n).version().map(|v| v.to_string())).unwrap_or_default();
		println!("{:<6} {} {}", action.to_string(), shown.display(), version);
	}
}

async fn print_diff(options: &ArborOptions, packages: &[String], dev: bool) -> Result<(), Error> {
	let mut graph = Graph::new();
	let ideal_root = ideal(options, &mut graph, packages, dev).await?;
	let actual_root = arbor::actual_tree::load_actual(&mut graph, options.path())?;
	let diff = Diff::calculate(&graph, actual_root, ideal_root, &Default::default());
	if diff.is_empty() {
		println!("up to date");
	}
	print_changes(&graph, &diff, options.path());
	Ok(())
}

async fn install(options: &ArborOptions, packages: &[String], dev: bool) -> Result<(), Error> {
	let mut graph = Graph::new();
	let ideal_root = ideal(options, &mut graph, packages, dev).await?;
	let actual_root = arbor::actual_tree::load_actual(&mut graph, options.path())?;

	let extractor = TarballExtractor::new(options).map_err(arbor::Error::from)?;
	let reifier = Reifier::new(options.clone(), Arc::new(extractor), Arc::new(NoopScripts));
	let outcome = reifier.reify(&mut graph, actual_root, ideal_root).await?;

	print_changes(&graph, &outcome.diff, options.path());
	for name in &outcome.failed_optional {
		println!("skipped optional dependency {}", name);
	}
	for path in &outcome.leftover_trash {
		println!("warning: could not remove {}", path.display());
	}
	if options.strict() {
		let mut check = Graph::new();
		let root = arbor::actual_tree::load_actual(&mut check, options.path())?;
		check.assert_tree_invariants(root)?;
	}
	Ok(())
}

fn verify(options: &ArborOptions) -> Result<(), Error> {
	let mut graph = Graph::new();
	let root = arbor::actual_tree::load_actual(&mut graph, options.path())?;
	let violations = graph.verify_tree_invariants(root);
	for v in &violations {
		println!("{}", v);
	}
	let mut broken = 0;
	for n in graph.tree_nodes(root) {
		for e in graph.node(n).edges_out().values() {
			let edge = graph.edge(*e);
			if let Some(error) = edge.error() {
				println!("{}: {} is {:?}", graph.node(n), edge, error);
				broken += 1;
			}
		}
	}
	println!("{} packages, {} invariant violations, {} unmet dependencies", graph.tree_nodes(root).len() - 1, violations.len(), broken);
	if violations.is_empty() {
		Ok(())
	} else {
		Err(Error::Invariant(violations.len()))
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("arbor error: {0}")]
	Arbor(#[from] arbor::Error),
	#[error("unknown command {0}")]
	UnknownCommand(String),
	#[error("invalid argument {0}")]
	InvalidArgument(String),
	#[error("{0} tree invariants violated")]
	Invariant(usize),
}
