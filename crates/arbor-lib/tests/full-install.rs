use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use arbor::actual_tree::load_actual;
use arbor::collaborators::{BuildTarget, ExtractError, Extractor, ScriptError, ScriptRunner};
use arbor::graph::EdgeType;
use arbor::ideal_tree::IdealTreeBuilder;
use arbor::lockfile::Lockfile;
use arbor::reify::{retire_path, Reifier, ReifyError, ReifyOutcome, Rollback, Stage};
use arbor::{ArborOptions, Graph, Manifest};
use arbor_test_utils::{build_ideal, install, options, project, reifier, snapshot_dir, tarball_url, MemoryRegistry, TestScripts};

fn with_script(manifest: Manifest, event: &str) -> Manifest {
	let mut manifest = manifest;
	manifest.scripts.insert(event.to_string(), String::from("node build.js"));
	manifest
}

fn registry() -> MemoryRegistry {
	let mut cli = Manifest::new("a", "1.0.0").dep("n", "1");
	cli.bin = Some(arbor::manifest::Bin::Single(String::from("cli.js")));
	MemoryRegistry::new()
		.publish(cli)
		.publish(Manifest::new("a", "2.0.0").dep("n", "1"))
		.publish(Manifest::new("n", "1.0.0"))
		.publish(Manifest::new("n", "2.0.0"))
		.publish(with_script(Manifest::new("c", "1.0.0"), "install"))
		.publish(Manifest::new("d", "1.0.0"))
}

/// Installs `a@1` with a nested `n@1`, then asks for `a@2` and `c`.
async fn installed_then_changed(registry: &Arc<MemoryRegistry>) -> tempfile::TempDir {
	let dir = project(&Manifest::new("root", "1.0.0").dep("a", "^1").dep("n", "^2")).unwrap();
	install(registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();
	Manifest::new("root", "1.0.0").dep("a", "^2").dep("n", "^2").dep("c", "1").write_to_dir(dir.path()).unwrap();
	dir
}

async fn reify_changes(registry: &Arc<MemoryRegistry>, scripts: Arc<TestScripts>, options: &ArborOptions, stop_after: Option<Stage>) -> arbor::Result<()> {
	let mut graph = Graph::new();
	let ideal = build_ideal(registry, options, &mut graph).await?.root;
	let actual = load_actual(&mut graph, options.path())?;
	let mut reifier = reifier(registry, scripts, options);
	if let Some(stage) = stop_after {
		reifier = reifier.stop_after(stage);
	}
	reifier.reify(&mut graph, actual, ideal).await.map(|_| ())
}

fn read_version(dir: &Path) -> Option<String> {
	Manifest::read_from_dir(dir).ok().and_then(|m| m.version)
}

#[tokio::test]
async fn installed_tree_matches_the_ideal_tree() {
	let _ = env_logger::builder().is_test(true).try_init();
	let registry = Arc::new(registry());
	let dir = project(&Manifest::new("root", "1.0.0").dep("a", "^1").dep("n", "^2").dev_dep("d", "1")).unwrap();
	let installed = install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();

	let mut graph = Graph::new();
	let on_disk = load_actual(&mut graph, dir.path()).unwrap();
	assert_eq!(graph.snapshot(on_disk), installed.graph.snapshot(installed.ideal));
	assert_eq!(read_version(&dir.path().join("node_modules/a/node_modules/n")).as_deref(), Some("1.0.0"));
	assert!(dir.path().join("node_modules/.bin/a").symlink_metadata().is_ok());
	assert!(installed.outcome.leftover_trash.is_empty());

	let lockfile = Lockfile::load(dir.path()).unwrap().unwrap();
	assert!(lockfile.packages["node_modules/d"].dev);
	assert!(Lockfile::load_hidden(dir.path()).unwrap().is_some());
}

#[tokio::test]
async fn installing_twice_changes_nothing() {
	let registry = Arc::new(registry());
	let dir = project(&Manifest::new("root", "1.0.0").dep("a", "^1").dep("n", "^2")).unwrap();
	install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();
	let before = snapshot_dir(dir.path()).unwrap();
	let extracts = registry.extract_count();

	let again = install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();
	assert!(again.outcome.diff.is_empty());
	assert_eq!(registry.extract_count(), extracts);
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());
}

#[tokio::test]
async fn changes_move_unchanged_children_back() {
	let registry = Arc::new(registry());
	let dir = installed_then_changed(&registry).await;
	reify_changes(&registry, Arc::new(TestScripts::new()), &options(dir.path()), None).await.unwrap();

	let nm = dir.path().join("node_modules");
	assert_eq!(read_version(&nm.join("a")).as_deref(), Some("2.0.0"));
	assert_eq!(read_version(&nm.join("a/node_modules/n")).as_deref(), Some("1.0.0"));
	assert_eq!(read_version(&nm.join("c")).as_deref(), Some("1.0.0"));
	let leftovers: Vec<_> = std::fs::read_dir(&nm).unwrap()
		.filter_map(|e| e.ok())
		.filter(|e| e.file_name().to_string_lossy().starts_with(".a-"))
		.collect();
	assert!(leftovers.is_empty());
}

#[tokio::test]
async fn interrupting_any_stage_restores_the_disk() {
	for stage in [Stage::Retire, Stage::SparseTree, Stage::Unpack, Stage::MoveBack, Stage::Build] {
		let registry = Arc::new(registry());
		let dir = installed_then_changed(&registry).await;
		let before = snapshot_dir(dir.path()).unwrap();

		let err = reify_changes(&registry, Arc::new(TestScripts::new()), &options(dir.path()), Some(stage)).await.unwrap_err();
		match err {
			arbor::Error::Reify(ReifyError::Interrupted { stage: s, rollback: Rollback::Complete }) => assert_eq!(s, stage),
			other => panic!("unexpected error after {}: {}", stage, other),
		}
		assert_eq!(before, snapshot_dir(dir.path()).unwrap(), "disk differs after stopping at {}", stage);
	}
}

#[tokio::test]
async fn failed_extraction_rolls_back() {
	let registry = Arc::new(registry().fail_extract("c"));
	let dir = installed_then_changed(&registry).await;
	let before = snapshot_dir(dir.path()).unwrap();

	let err = reify_changes(&registry, Arc::new(TestScripts::new()), &options(dir.path()), None).await.unwrap_err();
	assert!(matches!(err, arbor::Error::Reify(ReifyError::StageFailed { stage: Stage::Unpack, rollback: Rollback::Complete, .. })), "{}", err);
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());
}

#[tokio::test]
async fn failed_install_script_rolls_back() {
	let registry = Arc::new(registry());
	let dir = installed_then_changed(&registry).await;
	let before = snapshot_dir(dir.path()).unwrap();

	let scripts = Arc::new(TestScripts::new().fail("c"));
	let err = reify_changes(&registry, scripts.clone(), &options(dir.path()), None).await.unwrap_err();
	assert!(matches!(err, arbor::Error::Reify(ReifyError::StageFailed { stage: Stage::Build, rollback: Rollback::Complete, .. })), "{}", err);
	assert_eq!(scripts.ran(), vec![(String::from("c"), String::from("install"))]);
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());
}

#[tokio::test]
async fn failed_optional_packages_are_left_out() {
	let registry = Arc::new(registry()
		.publish(Manifest::new("native", "1.0.0"))
		.fail_extract("native"));
	let dir = project(&Manifest::new("root", "1.0.0").dep("n", "^2").optional_dep("native", "1")).unwrap();
	let installed = install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();

	assert!(installed.outcome.failed_optional.iter().any(|n| n.contains("native")));
	assert!(!dir.path().join("node_modules/native").exists());
	assert!(dir.path().join("node_modules/n").exists());
	let lockfile = Lockfile::load(dir.path()).unwrap().unwrap();
	assert!(!lockfile.packages.contains_key("node_modules/native"));
}

#[tokio::test]
async fn omitted_dev_dependencies_stay_in_the_lockfile_only() {
	let registry = Arc::new(registry());
	let dir = project(&Manifest::new("root", "1.0.0").dep("n", "^2").dev_dep("d", "1")).unwrap();
	let mut options = options(dir.path());
	options.set_omit([EdgeType::Dev]);
	install(&registry, Arc::new(TestScripts::new()), &options).await.unwrap();

	assert!(!dir.path().join("node_modules/d").exists());
	assert!(Lockfile::load(dir.path()).unwrap().unwrap().packages.contains_key("node_modules/d"));
	assert!(!Lockfile::load_hidden(dir.path()).unwrap().unwrap().packages.contains_key("node_modules/d"));
}

#[tokio::test]
async fn dependencies_are_built_before_dependents() {
	let registry = Arc::new(MemoryRegistry::new()
		.publish(with_script(Manifest::new("app", "1.0.0").dep("lib", "1"), "postinstall"))
		.publish(with_script(Manifest::new("lib", "1.0.0").dep("native", "1"), "install"))
		.publish(with_script(Manifest::new("native", "1.0.0"), "preinstall")));
	let dir = project(&Manifest::new("root", "1.0.0").dep("app", "1")).unwrap();
	let scripts = Arc::new(TestScripts::new());
	install(&registry, scripts.clone(), &options(dir.path())).await.unwrap();

	let order: BTreeMap<String, usize> = scripts.ran().into_iter().enumerate().map(|(i, (name, _))| (name, i)).collect();
	assert!(order["native"] < order["lib"]);
	assert!(order["lib"] < order["app"]);
}

/// Unpacks like the registry, then leaves a folder where the `package.json` of the nested `n`
/// below `a@2` has to be moved back to.
struct BlockMoveBack(Arc<MemoryRegistry>);

#[async_trait]
impl Extractor for BlockMoveBack {
	async fn extract(&self, resolved: &str, integrity: Option<&str>, destination: &Path) -> Result<(), ExtractError> {
		self.0.extract(resolved, integrity, destination).await?;
		if resolved == tarball_url("a", "2.0.0") {
			std::fs::create_dir_all(destination.join("node_modules/n/package.json/blocked"))?;
		}
		Ok(())
	}
}

/// Raises the interrupt flag from a lifecycle script, the way an embedding program's own signal
/// handler would.
#[derive(Default)]
struct InterruptingScripts(OnceLock<Arc<AtomicBool>>);

#[async_trait]
impl ScriptRunner for InterruptingScripts {
	async fn run_lifecycle(&self, _target: &BuildTarget, _event: &str) -> Result<(), ScriptError> {
		if let Some(flag) = self.0.get() {
			flag.store(true, Ordering::SeqCst);
		}
		Ok(())
	}

	async fn link_binaries(&self, target: &BuildTarget) -> Result<(), ScriptError> {
		arbor::registry::link_bins(target).await
	}
}

async fn reify_with(reifier: Reifier, registry: &Arc<MemoryRegistry>, options: &ArborOptions) -> arbor::Result<ReifyOutcome> {
	let mut graph = Graph::new();
	let ideal = build_ideal(registry, options, &mut graph).await?.root;
	let actual = load_actual(&mut graph, options.path())?;
	reifier.reify(&mut graph, actual, ideal).await
}

#[tokio::test]
async fn failing_to_retire_puts_earlier_folders_back() {
	let registry = Arc::new(registry());
	let dir = project(&Manifest::new("root", "1.0.0").dep("a", "^1").dep("n", "^2")).unwrap();
	install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();
	Manifest::new("root", "1.0.0").dep("a", "^2").dep("n", "^1").write_to_dir(dir.path()).unwrap();

	// a is retired first, n can't be moved onto a folder that isn't empty
	let blocker = retire_path(&dir.path().join("node_modules/n"));
	std::fs::create_dir_all(blocker.join("in-the-way")).unwrap();
	let before = snapshot_dir(dir.path()).unwrap();

	let err = reify_changes(&registry, Arc::new(TestScripts::new()), &options(dir.path()), None).await.unwrap_err();
	assert!(matches!(err, arbor::Error::Reify(ReifyError::StageFailed { stage: Stage::Retire, rollback: Rollback::Complete, .. })), "{}", err);
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());
}

#[tokio::test]
async fn failing_to_move_back_rolls_back() {
	let registry = Arc::new(registry());
	let dir = installed_then_changed(&registry).await;
	let before = snapshot_dir(dir.path()).unwrap();

	let options = options(dir.path());
	let reifier = Reifier::new(options.clone(), Arc::new(BlockMoveBack(registry.clone())), Arc::new(TestScripts::new()));
	let err = reify_with(reifier, &registry, &options).await.unwrap_err();
	assert!(matches!(err, arbor::Error::Reify(ReifyError::StageFailed { stage: Stage::MoveBack, rollback: Rollback::Complete, .. })), "{}", err);
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());
}

#[tokio::test]
async fn raising_the_interrupt_flag_rolls_back() {
	let registry = Arc::new(registry());
	let dir = installed_then_changed(&registry).await;
	let before = snapshot_dir(dir.path()).unwrap();

	let options = options(dir.path());
	let scripts = Arc::new(InterruptingScripts::default());
	let reifier = reifier(&registry, scripts.clone(), &options).handle_signals(false);
	assert!(scripts.0.set(reifier.interrupt_flag()).is_ok());
	let err = reify_with(reifier, &registry, &options).await.unwrap_err();
	assert!(matches!(err, arbor::Error::Reify(ReifyError::Interrupted { stage: Stage::Build, rollback: Rollback::Complete })), "{}", err);
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());
}

async fn install_adding(registry: &Arc<MemoryRegistry>, options: &ArborOptions, stop_after: Option<Stage>) -> arbor::Result<ReifyOutcome> {
	let mut graph = Graph::new();
	let ideal = IdealTreeBuilder::new(options.clone(), registry.clone())
		.add("a", "^1", EdgeType::Prod)
		.add("d", "1", EdgeType::Dev)
		.build(&mut graph)
		.await?
		.root;
	let actual = load_actual(&mut graph, options.path())?;
	let mut reifier = reifier(registry, Arc::new(TestScripts::new()), options);
	if let Some(stage) = stop_after {
		reifier = reifier.stop_after(stage);
	}
	reifier.reify(&mut graph, actual, ideal).await
}

#[tokio::test]
async fn requested_packages_are_saved_to_the_manifest() {
	let registry = Arc::new(registry());
	let dir = project(&Manifest::new("root", "1.0.0").dep("n", "^2")).unwrap();
	let options = options(dir.path());

	let before = snapshot_dir(dir.path()).unwrap();
	assert!(install_adding(&registry, &options, Some(Stage::Build)).await.is_err());
	assert_eq!(before, snapshot_dir(dir.path()).unwrap());

	install_adding(&registry, &options, None).await.unwrap();
	let manifest = Manifest::read_from_dir(dir.path()).unwrap();
	assert_eq!(manifest.dependencies.get("a").map(String::as_str), Some("^1"));
	assert_eq!(manifest.dependencies.get("n").map(String::as_str), Some("^2"));
	assert_eq!(manifest.dev_dependencies.get("d").map(String::as_str), Some("1"));

	// a plain install afterwards keeps them
	let again = install(&registry, Arc::new(TestScripts::new()), &options).await.unwrap();
	assert!(again.outcome.diff.is_empty());
	assert_eq!(read_version(&dir.path().join("node_modules/a")).as_deref(), Some("1.0.0"));
	assert_eq!(read_version(&dir.path().join("node_modules/d")).as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn deprecated_additions_are_reported() {
	let mut old = Manifest::new("old", "1.0.0");
	old.deprecated = Some(String::from("use n instead"));
	let registry = Arc::new(registry().publish(old));
	let dir = project(&Manifest::new("root", "1.0.0").dep("old", "1").dep("n", "^2")).unwrap();

	let installed = install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();
	assert_eq!(installed.outcome.deprecated, vec![String::from("old@1.0.0: use n instead")]);

	let again = install(&registry, Arc::new(TestScripts::new()), &options(dir.path())).await.unwrap();
	assert!(again.outcome.deprecated.is_empty());
}
