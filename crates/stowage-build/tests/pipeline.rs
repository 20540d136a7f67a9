//! End-to-end coverage of the layer-cached build pipeline against a
//! scratch store.

use anyhow::Result;
use stowage_build::{BuildError, BuildRequest, BuildService, ImageManifest, ImageStore};
use stowage_events::EventBus;
use stowage_telemetry::Metrics;
use stowage_test_support::BootstrapFixture;

fn service() -> BuildService {
    BuildService::new(EventBus::new(), Metrics::new().expect("metrics"))
}

fn seeded_fixture() -> Result<BootstrapFixture> {
    let fixture = BootstrapFixture::new()?;
    fixture.add_package("fastapi", "0.111.0")?;
    fixture.add_package("uvicorn", "0.30.1")?;
    fixture.write_manifest(&["fastapi==0.111.0", "uvicorn==0.30.1"])?;
    fixture.write_source_file("main.py", "app = 'credit-api'\n")?;
    fixture.write_source_file("reports/scoring.py", "WEIGHTS = [1, 2, 3]\n")?;
    Ok(fixture)
}

fn layer_count(store: &ImageStore) -> usize {
    std::fs::read_dir(store.root().join("layers"))
        .expect("layers dir")
        .count()
}

#[test]
fn rebuild_over_unchanged_inputs_reuses_every_layer() -> Result<()> {
    let fixture = seeded_fixture()?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;
    let metrics = Metrics::new()?;
    let service = BuildService::new(EventBus::new(), metrics.clone());

    let first = service.build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;
    assert_eq!(first.created_layers, 3);
    assert_eq!(first.reused_layers, 0);

    let second = service.build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;
    assert_eq!(second.image_id, first.image_id);
    assert_eq!(second.created_layers, 0);
    assert_eq!(second.reused_layers, 3);
    assert_eq!(layer_count(&store), 3);

    let meta_raw = std::fs::read_to_string(store.build_record_path(second.build_id))?;
    let meta: serde_json::Value = serde_json::from_str(&meta_raw)?;
    let install = meta["steps"]
        .as_array()
        .expect("recorded steps")
        .iter()
        .find(|step| step["name"] == "install_dependencies")
        .expect("install step record");
    assert_eq!(install["status"], "skipped");

    let rendered = metrics.render()?;
    assert!(rendered.contains("layer_cache_total{outcome=\"hit\"} 3"));
    Ok(())
}

#[test]
fn source_edit_keeps_the_install_layer_warm() -> Result<()> {
    let fixture = seeded_fixture()?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;
    let service = service();

    let first = service.build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    fixture.write_source_file("main.py", "app = 'credit-api-v2'\n")?;
    let second = service.build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    assert_ne!(second.image_id, first.image_id);
    assert_eq!(second.reused_layers, 2, "manifest and install layers reuse");
    assert_eq!(second.created_layers, 1, "only the source layer rebuilds");
    Ok(())
}

#[test]
fn manifest_edit_invalidates_install_and_later_layers() -> Result<()> {
    let fixture = seeded_fixture()?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;
    let service = service();

    let first = service.build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    fixture.add_package("pydantic", "2.7.0")?;
    fixture.write_manifest(&["fastapi==0.111.0", "uvicorn==0.30.1", "pydantic==2.7.0"])?;
    let second = service.build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    assert_ne!(second.image_id, first.image_id);
    assert_eq!(second.reused_layers, 0);
    assert_eq!(second.created_layers, 3);
    Ok(())
}

#[test]
fn missing_manifest_aborts_before_any_layer_is_committed() -> Result<()> {
    let fixture = BootstrapFixture::new()?;
    fixture.write_source_file("main.py", "app = object()\n")?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;

    let error = service()
        .build(
            &store,
            BuildRequest {
                recipe: &recipe,
                source_root: &fixture.source_root(),
            },
        )
        .expect_err("missing manifest must be fatal");

    assert!(matches!(
        error.downcast_ref::<BuildError>(),
        Some(BuildError::ManifestMissing { .. })
    ));
    assert_eq!(layer_count(&store), 0, "no layer may be committed");
    Ok(())
}

#[test]
fn unpinned_package_fails_the_install_step() -> Result<()> {
    let fixture = BootstrapFixture::new()?;
    fixture.write_manifest(&["ghost==9.9.9"])?;
    fixture.write_source_file("main.py", "app = object()\n")?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;

    let error = service()
        .build(
            &store,
            BuildRequest {
                recipe: &recipe,
                source_root: &fixture.source_root(),
            },
        )
        .expect_err("unresolvable package must be fatal");

    assert!(matches!(
        error.downcast_ref::<BuildError>(),
        Some(BuildError::PackageMissing { .. })
    ));
    assert_eq!(layer_count(&store), 1, "only the manifest layer exists");
    Ok(())
}

#[test]
fn no_cache_builds_leave_the_download_cache_untouched() -> Result<()> {
    let fixture = seeded_fixture()?;
    let store = ImageStore::open(fixture.store_root())?;
    let mut recipe = fixture.recipe("uvicorn", 8000)?;
    recipe.install.no_cache = true;

    service().build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    let cached = std::fs::read_dir(store.root().join("cache/packages"))
        .expect("cache dir")
        .count();
    assert_eq!(cached, 0);
    Ok(())
}

#[test]
fn image_record_captures_layers_and_launch_spec() -> Result<()> {
    let fixture = seeded_fixture()?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;

    let report = service().build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    let manifest = ImageManifest::load(&store, &report.image_id)?;
    assert_eq!(manifest.base.reference(), "python-slim:3.11");
    let steps: Vec<_> = manifest.layers.iter().map(|layer| layer.step.as_str()).collect();
    assert_eq!(
        steps,
        vec!["stage_manifest", "install_dependencies", "copy_source"]
    );
    assert_eq!(manifest.config.exposed_port, 8000);
    assert_eq!(manifest.config.launch.program, "uvicorn");
    assert_eq!(
        manifest.config.launch.args,
        vec!["main:app", "--host", "127.0.0.1", "--port", "8000"]
    );

    let source_fs = store.layer_fs(&manifest.layers[2].digest);
    assert!(source_fs.join("app/main.py").is_file());
    assert!(source_fs.join("app/reports/scoring.py").is_file());
    Ok(())
}

#[test]
fn excluded_directories_stay_out_of_the_source_layer() -> Result<()> {
    let fixture = seeded_fixture()?;
    fixture.write_source_file(".git/HEAD", "ref: refs/heads/main\n")?;
    fixture.write_source_file(".git/objects/aa/blob", "binary\n")?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;

    let report = service().build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    // The recipe's `**/.git/**` pattern matches only the files under
    // `.git`; the directory must not survive as an empty dir either.
    let manifest = ImageManifest::load(&store, &report.image_id)?;
    let source_fs = store.layer_fs(&manifest.layers[2].digest);
    assert!(source_fs.join("app/main.py").is_file());
    assert!(!source_fs.join("app/.git").exists());
    Ok(())
}

#[test]
fn exported_archive_is_written() -> Result<()> {
    let fixture = seeded_fixture()?;
    let store = ImageStore::open(fixture.store_root())?;
    let recipe = fixture.recipe("uvicorn", 8000)?;

    let report = service().build(
        &store,
        BuildRequest {
            recipe: &recipe,
            source_root: &fixture.source_root(),
        },
    )?;

    let output = fixture.path().join("image.tar.gz");
    stowage_build::export_image(&store, &report.image_id, &output)?;
    let exported = std::fs::metadata(&output)?;
    assert!(exported.len() > 0);
    Ok(())
}
