use crate::engine::Engine;
use crate::record::TestRecord;
use crate::report::Ledger;
use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use tracing::debug;

pub const DEFAULT_JOBS: usize = 8;

/// All records parsed from one file; the ledger prints the file's tally once
/// every one of them has settled.
#[derive(Debug)]
pub struct FileBatch {
    pub file: PathBuf,
    pub records: Vec<TestRecord>,
}

pub struct Scheduler<'a> {
    engine: &'a Engine,
    jobs: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(engine: &'a Engine, jobs: usize) -> Self {
        Self {
            engine,
            jobs: jobs.max(1),
        }
    }

    /// Feeds every batch to `jobs` workers as it arrives. An `Err` batch stops
    /// submission; records already submitted still settle before the error is
    /// returned.
    pub fn run<W, I>(&self, batches: I, ledger: &Ledger<W>) -> Result<()>
    where
        W: Write + Send,
        I: IntoIterator<Item = Result<FileBatch>>,
    {
        let (tx, rx) = mpsc::sync_channel::<TestRecord>(self.jobs);
        let rx = Mutex::new(rx);
        thread::scope(|scope| {
            for worker in 0..self.jobs {
                let rx = &rx;
                scope.spawn(move || {
                    while let Some(mut record) = next(rx) {
                        if let Err(err) = self.engine.execute(&mut record) {
                            record.force_failure(format!("{err:#}"));
                        }
                        ledger.settle(record);
                    }
                    debug!("worker {worker} done");
                });
            }

            let mut outcome = Ok(());
            'feed: for batch in batches {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                };
                if batch.records.is_empty() {
                    continue;
                }
                ledger.open_file(&batch.file, batch.records.len());
                for record in batch.records {
                    if tx.send(record).is_err() {
                        break 'feed;
                    }
                }
            }
            drop(tx);
            outcome
        })
    }
}

fn next(rx: &Mutex<Receiver<TestRecord>>) -> Option<TestRecord> {
    let guard = match rx.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.recv().ok()
}
