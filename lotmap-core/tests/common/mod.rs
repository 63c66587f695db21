// Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use lotmap_core::classify::classify;
use lotmap_core::data::{Database, MappedSite};
use lotmap_core::model::RunStatus;
use lotmap_core::template::extract;
use lotmap_scanner::{FetchError, FetchOptions, UrlMapper};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

pub fn create_test_db() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path).unwrap();
    (temp_dir, db)
}

pub fn urls(domain: &str, paths: &[&str]) -> Vec<String> {
    paths
        .iter()
        .map(|p| format!("https://{}{}", domain, p))
        .collect()
}

/// Record a successful fetch for `site_id` the same way a run would.
pub fn map_site(db: &mut Database, run_id: &str, site_id: i64, urls: &[String]) {
    let templates = extract(urls);
    let classification = classify(templates.keys());
    db.record_site_mapped(
        run_id,
        site_id,
        &MappedSite {
            urls,
            attempts: 1,
            templates: &templates,
            classification: &classification,
        },
    )
    .unwrap();
}

/// Create a run over `sites`, map each with its URLs and close the run.
pub fn seed_run(db: &mut Database, sites: &[(i64, Vec<String>)]) -> String {
    let ids: Vec<i64> = sites.iter().map(|(id, _)| *id).collect();
    let run_id = db.create_run(&ids, 2, 0).unwrap();
    for (site_id, site_urls) in sites {
        map_site(db, &run_id, *site_id, site_urls);
    }
    db.finish_run(&run_id, RunStatus::Done, None).unwrap();
    run_id
}

/// The three-site scenario: A and B share a shape, C has none.
pub fn seed_scenario(db: &mut Database) -> (i64, i64, i64, String) {
    let a = db.upsert_site("a.com.br", "Leiloes A").unwrap();
    let b = db.upsert_site("b.com.br", "Leiloes B").unwrap();
    let c = db.upsert_site("c.com.br", "Leiloes C").unwrap();

    let run_id = seed_run(
        db,
        &[
            (
                a,
                urls(
                    "a.com.br",
                    &["/leilao/10/lotes", "/item/55/detalhes", "/item/56/detalhes"],
                ),
            ),
            (b, urls("b.com.br", &["/leilao/20/lotes", "/item/99/detalhes"])),
            (c, urls("c.com.br", &["/sobre"])),
        ],
    );
    (a, b, c, run_id)
}

/// Mapper answering from a per-domain script. The last scripted answer
/// repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedMapper {
    scripts: Mutex<HashMap<String, Vec<Result<Vec<String>, FetchError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    starts: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, domain: &str, answers: Vec<Result<Vec<String>, FetchError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(domain.to_string(), answers);
        self
    }

    pub fn ok(self, domain: &str, paths: &[&str]) -> Self {
        let list = urls(domain, paths);
        self.with(domain, vec![Ok(list)])
    }

    pub fn calls(&self, domain: &str) -> usize {
        self.calls.lock().unwrap().get(domain).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// When each fetch started, in call order.
    pub fn start_times(&self) -> Vec<tokio::time::Instant> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl UrlMapper for ScriptedMapper {
    async fn fetch_urls(
        &self,
        domain: &str,
        _options: &FetchOptions,
    ) -> Result<Vec<String>, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.starts.lock().unwrap().push(tokio::time::Instant::now());

        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(domain.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let answer = {
            let scripts = self.scripts.lock().unwrap();
            match scripts.get(domain) {
                Some(answers) if !answers.is_empty() => {
                    answers[(call - 1).min(answers.len() - 1)].clone()
                }
                _ => Err(FetchError::Http {
                    status: 404,
                    message: "unknown domain".to_string(),
                }),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}
