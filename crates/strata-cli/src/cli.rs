use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_ingest::{
    ExportEngine, IngestOutcome, IngestionPipeline, ParallelIngestor, RoundTrip, StrataConfig,
};
use strata_runtime::{AsyncLimiter, CancelToken};
use strata_store::{HashCache, MemoryBackend, NodeKind, NodeRef, NodeStore, StoreError};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Content-addressed grammar store for text", long_about = None)]
pub struct Cli {
    /// Snapshot file holding the node store
    #[arg(long, global = true, env = "STRATA_DB", default_value = "strata.db")]
    pub db: PathBuf,

    /// Configuration file (.toml or .json)
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest a text file and print its root
    Ingest { file: PathBuf },
    /// Reconstruct the text under a root
    Export {
        #[arg(value_parser = parse_root)]
        root: NodeRef,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check that a root reproduces a file exactly
    Verify {
        #[arg(value_parser = parse_root)]
        root: NodeRef,
        file: PathBuf,
    },
    /// Print node counts
    Stats,
    /// Ingest several files concurrently
    Batch {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn parse_root(s: &str) -> std::result::Result<NodeRef, String> {
    s.parse().map_err(|e: StoreError| e.to_string())
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub leaves: usize,
    pub composites: usize,
}

/// An opened snapshot plus the configuration used to work on it.
pub struct Session {
    db: PathBuf,
    config: StrataConfig,
    backend: Arc<MemoryBackend>,
}

impl Session {
    pub fn open(db: &Path, config: StrataConfig) -> Result<Self> {
        let backend = MemoryBackend::open_or_new(db)
            .with_context(|| format!("opening snapshot {}", db.display()))?;
        Ok(Self {
            db: db.to_path_buf(),
            config,
            backend: Arc::new(backend),
        })
    }

    pub fn save(&self) -> Result<()> {
        self.backend
            .save(&self.db)
            .with_context(|| format!("saving snapshot {}", self.db.display()))
    }

    fn store(&self) -> NodeStore<MemoryBackend> {
        NodeStore::new(self.backend.clone()).with_config(self.config.store.clone())
    }

    fn engine(&self) -> ExportEngine<MemoryBackend> {
        ExportEngine::new(self.store(), self.config.export.clone())
    }

    pub async fn ingest_file(&self, file: &Path, token: &CancelToken) -> Result<IngestOutcome> {
        let text = read_text(file)?;
        let pipeline = IngestionPipeline::new(self.store(), self.config.inducer.clone())
            .with_seed_kind(self.config.seed_kind);
        Ok(pipeline.ingest_text(&text, token).await?)
    }

    pub async fn export(&self, root: NodeRef, token: &CancelToken) -> Result<String> {
        Ok(self.engine().export_text(root, token).await?)
    }

    pub async fn verify(&self, root: NodeRef, file: &Path, token: &CancelToken) -> Result<RoundTrip> {
        let text = read_text(file)?;
        let original: Vec<u32> = text.chars().map(u32::from).collect();
        Ok(self.engine().verify_roundtrip(root, &original, token).await?)
    }

    pub async fn counts(&self, token: &CancelToken) -> Result<StoreCounts> {
        let store = self.store();
        Ok(StoreCounts {
            leaves: store.count(NodeKind::Leaf, token).await?,
            composites: store.count(NodeKind::Composite, token).await?,
        })
    }

    /// Ingest every file concurrently. Unreadable files fail individually.
    pub async fn batch(
        &self,
        files: &[PathBuf],
        token: &CancelToken,
    ) -> Result<Vec<Result<IngestOutcome>>> {
        let parallel = &self.config.parallel;
        let store = self
            .store()
            .with_cache(Arc::new(HashCache::new(
                parallel.cache_capacity,
                parallel.cache_evict_fraction,
            )))
            .with_limiter(AsyncLimiter::new(parallel.max_concurrency));
        let ingestor =
            ParallelIngestor::with_store(store, self.config.inducer.clone(), parallel.clone())
                .with_seed_kind(self.config.seed_kind)?;

        let mut slots: Vec<Option<Result<IngestOutcome>>> = Vec::with_capacity(files.len());
        let mut texts = Vec::new();
        for file in files {
            match read_text(file) {
                Ok(text) => {
                    texts.push(text);
                    slots.push(None);
                }
                Err(e) => slots.push(Some(Err(e))),
            }
        }

        let mut outcomes = ingestor.ingest_many(texts, token).await.into_iter();
        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Some(failed) => failed,
                None => match outcomes.next() {
                    Some(result) => result.map_err(anyhow::Error::from),
                    None => Err(anyhow::anyhow!("missing batch result")),
                },
            })
            .collect())
    }
}

fn read_text(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

impl Cli {
    pub async fn run(self, token: CancelToken) -> Result<()> {
        let config = StrataConfig::load(self.config.as_deref())?;
        let session = Session::open(&self.db, config)?;
        match self.command {
            Command::Ingest { ref file } => {
                let outcome = session.ingest_file(file, &token).await?;
                session.save()?;
                println!("root: {}", outcome.root);
                println!("{}", serde_json::to_string_pretty(&outcome.stats)?);
                Ok(())
            }
            Command::Export { root, ref output } => {
                let text = session.export(root, &token).await?;
                match output {
                    Some(path) => std::fs::write(path, text)
                        .with_context(|| format!("writing {}", path.display()))?,
                    None => print!("{}", text),
                }
                Ok(())
            }
            Command::Verify { root, ref file } => {
                let report = session.verify(root, file, &token).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.matches {
                    anyhow::bail!("{} does not reproduce {}", root, file.display());
                }
                Ok(())
            }
            Command::Stats => {
                let counts = session.counts(&token).await?;
                println!("Leaves: {}", counts.leaves);
                println!("Composites: {}", counts.composites);
                Ok(())
            }
            Command::Batch { ref files } => {
                let results = session.batch(files, &token).await?;
                session.save()?;
                let mut failed = 0;
                for (file, result) in files.iter().zip(results) {
                    match result {
                        Ok(outcome) => println!(
                            "{}\t{}\t{:.3}",
                            file.display(),
                            outcome.root,
                            outcome.stats.compression_ratio
                        ),
                        Err(e) => {
                            failed += 1;
                            eprintln!("{}\terror: {:#}", file.display(), e);
                        }
                    }
                }
                if failed > 0 {
                    anyhow::bail!("{} of {} files failed", failed, files.len());
                }
                Ok(())
            }
        }
    }
}
