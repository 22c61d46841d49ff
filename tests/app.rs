use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use grid_ingest::app::{Orchestrator, ProgressEvent, ProgressSink};
use grid_ingest::config::RunConfig;
use grid_ingest::dataset::{ArrayData, Dataset, Variable};
use grid_ingest::domain::{
    ChunkGeometry, FailurePolicy, FirstBatchPolicy, Location, Scheme, SourceLocation, WriteMode,
};
use grid_ingest::error::IngestError;
use grid_ingest::storage::{self, Backends, MemoryStore};
use grid_ingest::reader::{JsonDatasetReader, SourceReader, encode_document};
use grid_ingest::store::StoreReader;

const SOURCE: &str = "memory://ghrsst/2022/*.json";
const STORE: &str = "memory://zarr/sst.zarr";

fn granule(day: i64) -> Dataset {
    Dataset::new()
        .with_coord("time", Variable::from_values("time", vec![day * 86_400]))
        .unwrap()
        .with_coord("lat", Variable::from_values("lat", vec![-1.0f32, 1.0]))
        .unwrap()
        .with_coord("lon", Variable::from_values("lon", vec![10.0f32, 20.0]))
        .unwrap()
        .with_data_var(
            "sea_surface_temperature",
            Variable::new(
                ["time", "lat", "lon"],
                vec![1, 2, 2],
                ArrayData::from_vec(vec![270.0 + day as f32; 4]),
            )
            .unwrap(),
        )
        .unwrap()
        .with_data_var(
            "wind_speed",
            Variable::new(["time", "lat", "lon"], vec![1, 2, 2], ArrayData::from_vec(vec![3.0f32; 4]))
                .unwrap(),
        )
        .unwrap()
}

fn key(day: i64) -> String {
    format!("ghrsst/2022/{day:03}-L3S.json")
}

fn seeded_backends(files: i64) -> Backends {
    let memory = MemoryStore::new();
    for day in 0..files {
        storage::put(&memory, &key(day), encode_document(&granule(day), false).unwrap()).unwrap();
    }
    Backends::with_memory(Arc::new(memory))
}

fn config(policy: FailurePolicy) -> RunConfig {
    let mut config = RunConfig::new(SOURCE, STORE.parse().unwrap());
    config.batch_size = 10;
    config.retries = 2;
    config.retry_delay = Duration::ZERO;
    config.workers = 4;
    config.policy = policy;
    config
}

struct BrokenFile {
    inner: JsonDatasetReader,
    broken: String,
    attempts: AtomicU32,
}

impl BrokenFile {
    fn new(backends: &Backends, broken: String) -> Arc<Self> {
        Arc::new(Self {
            inner: JsonDatasetReader::new(backends.clone()),
            broken,
            attempts: AtomicU32::new(0),
        })
    }
}

impl SourceReader for BrokenFile {
    fn open(&self, location: &SourceLocation) -> Result<Dataset, IngestError> {
        if location.key() == self.broken {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(IngestError::Decode {
                location: location.to_string(),
                reason: "HDF error".to_string(),
            });
        }
        self.inner.open(location)
    }
}

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for Recorder {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn stored_days(backends: &Backends) -> Vec<i64> {
    let store: Location = STORE.parse().unwrap();
    let reader = StoreReader::open(backends, &store).unwrap();
    reader
        .read_variable("time")
        .unwrap()
        .data()
        .to_vec::<i64>()
        .unwrap()
        .into_iter()
        .map(|seconds| seconds / 86_400)
        .collect()
}

#[test]
fn ingest_all_batches_in_order() {
    let backends = seeded_backends(25);
    let orchestrator = Orchestrator::with_json_reader(config(FailurePolicy::FailFast), backends.clone());
    let recorder = Recorder::default();
    let report = orchestrator.run(&recorder).unwrap();

    assert_eq!(report.files_discovered, 25);
    assert_eq!(report.batches.len(), 3);
    assert_eq!(report.batches[0].mode, Some(WriteMode::Create));
    assert_eq!(report.batches[1].mode, Some(WriteMode::Append));
    assert_eq!(report.batches[2].files, 5);
    assert_eq!(report.growth_len, 25);
    assert!(!report.is_partial());
    assert_eq!(stored_days(&backends), (0..25).collect::<Vec<_>>());

    let store = StoreReader::open(&backends, &STORE.parse().unwrap()).unwrap();
    assert!(!store.layout().arrays.contains_key("wind_speed"));
    let sst = store.read_variable("sea_surface_temperature").unwrap();
    assert_eq!(sst.shape(), &[25, 2, 2]);
    assert_eq!(sst.data().to_vec::<f32>().unwrap()[24 * 4], 294.0);

    let messages = recorder.messages.lock().unwrap();
    assert!(messages[0].contains("found 25 files"));
    assert!(messages.last().unwrap().contains("finished 25 out of 25 files"));
}

#[test]
fn best_effort_skips_broken_file() {
    let backends = seeded_backends(25);
    let reader = BrokenFile::new(&backends, key(13));
    let orchestrator = Orchestrator::new(
        config(FailurePolicy::BestEffort),
        backends.clone(),
        reader.clone(),
    );
    let report = orchestrator.run(&Recorder::default()).unwrap();

    assert!(report.is_partial());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].batch, 1);
    assert_eq!(report.failures[0].attempts, 3);
    assert_eq!(reader.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.batches[1].failed, 1);
    assert_eq!(report.growth_len, 24);

    let expected: Vec<i64> = (0..25).filter(|day| *day != 13).collect();
    assert_eq!(stored_days(&backends), expected);
}

#[test]
fn fail_fast_stops_after_committed_batches() {
    let backends = seeded_backends(25);
    let reader = BrokenFile::new(&backends, key(13));
    let orchestrator = Orchestrator::new(config(FailurePolicy::FailFast), backends.clone(), reader);
    let err = orchestrator.run(&Recorder::default()).unwrap_err();

    assert_matches!(
        err,
        IngestError::TaskFailed { batch: 1, attempts: 3, ref location, .. }
            if location.ends_with("013-L3S.json")
    );
    assert_eq!(stored_days(&backends), (0..10).collect::<Vec<_>>());
}

#[test]
fn require_complete_first_batch_creates_nothing() {
    let backends = seeded_backends(12);
    let reader = BrokenFile::new(&backends, key(4));
    let mut config = config(FailurePolicy::BestEffort);
    config.first_batch_policy = FirstBatchPolicy::RequireComplete;
    let err = Orchestrator::new(config, backends.clone(), reader)
        .run(&Recorder::default())
        .unwrap_err();

    assert_matches!(err, IngestError::TaskFailed { batch: 0, .. });
    let store: Location = STORE.parse().unwrap();
    assert!(StoreReader::try_open(&backends, &store).unwrap().is_none());
}

#[test]
fn partial_first_batch_creates_store() {
    let backends = seeded_backends(12);
    let reader = BrokenFile::new(&backends, key(0));
    let report = Orchestrator::new(config(FailurePolicy::BestEffort), backends.clone(), reader)
        .run(&Recorder::default())
        .unwrap();
    assert_eq!(report.growth_len, 11);
    assert_eq!(stored_days(&backends), (1..12).collect::<Vec<_>>());
}

#[test]
fn nothing_readable_is_an_error() {
    let backends = seeded_backends(1);
    let reader = BrokenFile::new(&backends, key(0));
    let err = Orchestrator::new(config(FailurePolicy::BestEffort), backends, reader)
        .run(&Recorder::default())
        .unwrap_err();
    assert_matches!(err, IngestError::NothingWritten);
}

#[test]
fn no_matching_sources_is_an_error() {
    let backends = seeded_backends(0);
    let err = Orchestrator::with_json_reader(config(FailurePolicy::FailFast), backends)
        .run(&Recorder::default())
        .unwrap_err();
    assert_matches!(err, IngestError::NoSources(_));
}

#[test]
fn rerun_recreates_store_with_new_geometry() {
    let backends = seeded_backends(5);
    Orchestrator::with_json_reader(config(FailurePolicy::FailFast), backends.clone())
        .run(&Recorder::default())
        .unwrap();

    let mut narrow = config(FailurePolicy::FailFast);
    narrow.batch_size = 2;
    narrow.geometry = ChunkGeometry::new([("time", 10), ("lat", 1), ("lon", 1500)]);
    let report = Orchestrator::with_json_reader(narrow, backends.clone())
        .run(&Recorder::default())
        .unwrap();
    assert_eq!(report.growth_len, 5);
    let store = StoreReader::open(&backends, &STORE.parse().unwrap()).unwrap();
    assert_eq!(store.layout().arrays["lat"].chunks, vec![1]);
}

#[test]
fn plan_applies_limit_without_reading() {
    let backends = seeded_backends(25);
    let mut config = config(FailurePolicy::FailFast);
    config.limit = Some(12);
    let orchestrator = Orchestrator::with_json_reader(config, backends.clone());
    let plan = orchestrator.plan_report().unwrap();

    assert_eq!(plan.files_discovered, 12);
    assert_eq!(plan.batches.len(), 2);
    assert_eq!(plan.batches[0].mode, WriteMode::Create);
    assert_eq!(plan.batches[1].locations.len(), 2);
    let store: Location = STORE.parse().unwrap();
    assert!(StoreReader::try_open(&backends, &store).unwrap().is_none());
}

#[test]
fn ingest_into_local_directory() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    std::fs::create_dir_all(root.join("src")).unwrap();
    for day in 0..3 {
        std::fs::write(
            root.join(format!("src/{day}.json.gz")),
            encode_document(&granule(day), true).unwrap(),
        )
        .unwrap();
    }

    let store: Location = format!("file://{root}/out.zarr").parse().unwrap();
    let mut config = RunConfig::new(format!("file://{root}/src/*.json.gz"), store.clone());
    config.batch_size = 2;
    config.retry_delay = Duration::ZERO;
    let report = Orchestrator::with_json_reader(config, Backends::new())
        .run(&Recorder::default())
        .unwrap();

    assert_eq!(report.growth_len, 3);
    assert!(root.join("out.zarr/zarr.json").exists());
    let reader = StoreReader::open(&Backends::new(), &store).unwrap();
    assert_eq!(reader.dim_len("time"), Some(3));
}

#[test]
fn store_at_backend_root_is_rejected_before_listing() {
    let backends = seeded_backends(3);
    let mut config = config(FailurePolicy::FailFast);
    config.store = "memory://".parse().unwrap();
    let err = Orchestrator::with_json_reader(config, backends.clone())
        .run(&Recorder::default())
        .unwrap_err();
    assert_matches!(err, IngestError::InvalidLocation(_));

    let memory_keys = storage::list(&*backends.resolve(&STORE.parse().unwrap()).unwrap(), "").unwrap();
    assert_eq!(memory_keys.len(), 3);
}

#[test]
fn store_holding_the_sources_is_rejected() {
    let backends = seeded_backends(3);
    let mut config = config(FailurePolicy::FailFast);
    config.store = "memory://ghrsst".parse().unwrap();
    let err = Orchestrator::with_json_reader(config, backends.clone())
        .run(&Recorder::default())
        .unwrap_err();
    assert_matches!(err, IngestError::InvalidLocation(_));
    assert!(
        JsonDatasetReader::new(backends)
            .open(&Location::new(Scheme::Memory, key(0)))
            .is_ok()
    );
}
