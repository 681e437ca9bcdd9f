// =============================================================================
// Instrument Catalog — searchable snapshot of tradable instruments
// =============================================================================
//
// Readers get a consistent view without locking: the whole catalog is an
// immutable `Arc<CatalogSnapshot>` swapped atomically on refresh. Refresh is
// driven at broker connect time and by a periodic background task; the last
// snapshot is persisted to `catalog/<broker>.json` so search works offline
// at startup.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::{Exchange, Instrument, InstrumentRef, Segment};

/// Search results are capped regardless of the caller's `limit`.
pub const MAX_SEARCH_LIMIT: usize = 500;

/// One refreshed generation of the instrument master.
pub struct CatalogSnapshot {
    pub broker: String,
    pub refreshed_at: DateTime<Utc>,
    instruments: Vec<Instrument>,
    by_token: HashMap<u32, usize>,
    by_ref: HashMap<(Exchange, String), usize>,
}

impl CatalogSnapshot {
    fn build(broker: String, refreshed_at: DateTime<Utc>, instruments: Vec<Instrument>) -> Self {
        let mut by_token = HashMap::with_capacity(instruments.len());
        let mut by_ref = HashMap::with_capacity(instruments.len());
        for (idx, instrument) in instruments.iter().enumerate() {
            by_token.insert(instrument.instrument_token, idx);
            by_ref.insert(
                (instrument.exchange, instrument.trading_symbol.clone()),
                idx,
            );
        }
        Self {
            broker,
            refreshed_at,
            instruments,
            by_token,
            by_ref,
        }
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

/// Search parameters for [`InstrumentCatalog::search`].
#[derive(Debug, Default, Clone)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub exchange: Option<Exchange>,
    pub segment: Option<Segment>,
    pub limit: usize,
    pub offset: usize,
}

// =============================================================================
// InstrumentCatalog
// =============================================================================

pub struct InstrumentCatalog {
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    dir: PathBuf,
}

impl InstrumentCatalog {
    /// Create an empty catalog rooted at `<data_dir>/catalog`, loading the
    /// most recent persisted snapshot for `broker` when one exists.
    pub fn new(data_dir: &Path, broker: &str) -> Result<Self> {
        let dir = data_dir.join("catalog");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create catalog dir {}", dir.display()))?;

        let catalog = Self {
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::build(
                broker.to_string(),
                DateTime::<Utc>::MIN_UTC,
                Vec::new(),
            ))),
            dir,
        };

        if let Err(e) = catalog.load_persisted(broker) {
            warn!(broker = %broker, error = %e, "no usable persisted catalog snapshot");
        }
        Ok(catalog)
    }

    fn path_for(&self, broker: &str) -> PathBuf {
        self.dir.join(format!("{broker}.json"))
    }

    /// Replace the snapshot wholesale and persist it.
    pub fn replace(&self, broker: &str, instruments: Vec<Instrument>) -> Result<()> {
        let refreshed_at = Utc::now();
        let count = instruments.len();
        let snapshot = Arc::new(CatalogSnapshot::build(
            broker.to_string(),
            refreshed_at,
            instruments,
        ));

        self.persist(broker, &snapshot)?;
        *self.snapshot.write() = snapshot;
        info!(broker = %broker, count, "instrument catalog refreshed");
        Ok(())
    }

    fn persist(&self, broker: &str, snapshot: &CatalogSnapshot) -> Result<()> {
        #[derive(serde::Serialize)]
        struct Persisted<'a> {
            refreshed_at: DateTime<Utc>,
            instruments: &'a [Instrument],
        }
        let path = self.path_for(broker);
        let content = serde_json::to_string(&Persisted {
            refreshed_at: snapshot.refreshed_at,
            instruments: &snapshot.instruments,
        })
        .context("failed to serialise catalog")?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write catalog tmp {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename catalog to {}", path.display()))?;
        Ok(())
    }

    fn load_persisted(&self, broker: &str) -> Result<()> {
        #[derive(serde::Deserialize)]
        struct Persisted {
            refreshed_at: DateTime<Utc>,
            instruments: Vec<Instrument>,
        }
        let path = self.path_for(broker);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let persisted: Persisted =
            serde_json::from_str(&content).context("failed to parse persisted catalog")?;

        let count = persisted.instruments.len();
        *self.snapshot.write() = Arc::new(CatalogSnapshot::build(
            broker.to_string(),
            persisted.refreshed_at,
            persisted.instruments,
        ));
        info!(broker = %broker, count, "instrument catalog loaded from disk");
        Ok(())
    }

    /// Current snapshot pointer (cheap clone of an `Arc`).
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().clone()
    }

    /// Whether the snapshot is older than `max_age_secs` (or empty).
    pub fn is_stale(&self, max_age_secs: i64) -> bool {
        let snapshot = self.snapshot();
        snapshot.is_empty()
            || (Utc::now() - snapshot.refreshed_at).num_seconds() > max_age_secs
    }

    pub fn get_by_token(&self, token: u32) -> Option<Instrument> {
        let snapshot = self.snapshot();
        snapshot
            .by_token
            .get(&token)
            .map(|&idx| snapshot.instruments[idx].clone())
    }

    /// Resolve a configured `(exchange, trading_symbol)` pair.
    pub fn resolve(&self, reference: &InstrumentRef) -> Option<Instrument> {
        let snapshot = self.snapshot();
        snapshot
            .by_ref
            .get(&(reference.exchange, reference.trading_symbol.to_uppercase()))
            .map(|&idx| snapshot.instruments[idx].clone())
    }

    /// Substring search over trading symbols with prefix matches ranked
    /// first. Numeric queries also match `instrument_token` exactly.
    /// Returns `(page, total_matches)`.
    pub fn search(&self, query: &SearchQuery) -> (Vec<Instrument>, usize) {
        let snapshot = self.snapshot();
        let needle = query
            .text
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_uppercase();
        let token_needle: Option<u32> = needle.parse().ok();

        let mut prefix_matches = Vec::new();
        let mut substring_matches = Vec::new();

        for instrument in &snapshot.instruments {
            if let Some(exchange) = query.exchange {
                if instrument.exchange != exchange {
                    continue;
                }
            }
            if let Some(segment) = query.segment {
                if instrument.segment != segment {
                    continue;
                }
            }

            if needle.is_empty() {
                substring_matches.push(instrument);
                continue;
            }

            if token_needle == Some(instrument.instrument_token) {
                prefix_matches.push(instrument);
                continue;
            }

            let symbol = instrument.trading_symbol.to_uppercase();
            if symbol.starts_with(&needle) {
                prefix_matches.push(instrument);
            } else if symbol.contains(&needle) {
                substring_matches.push(instrument);
            }
        }

        prefix_matches.extend(substring_matches);
        let total = prefix_matches.len();

        let limit = if query.limit == 0 {
            50
        } else {
            query.limit.min(MAX_SEARCH_LIMIT)
        };
        let page = prefix_matches
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();

        (page, total)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(token: u32, symbol: &str, exchange: Exchange, segment: Segment) -> Instrument {
        Instrument {
            instrument_token: token,
            exchange,
            trading_symbol: symbol.to_string(),
            name: None,
            segment,
            lot_size: 1,
            tick_size: 0.05,
            expiry: None,
            strike: None,
            option_type: None,
        }
    }

    fn sample_catalog() -> (tempfile::TempDir, InstrumentCatalog) {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = InstrumentCatalog::new(tmp.path(), "paper").unwrap();
        catalog
            .replace(
                "paper",
                vec![
                    instrument(1, "RELIANCE", Exchange::NSE, Segment::Equity),
                    instrument(2, "RELINFRA", Exchange::NSE, Segment::Equity),
                    instrument(3, "TCS", Exchange::NSE, Segment::Equity),
                    instrument(4, "RELIANCE", Exchange::BSE, Segment::Equity),
                    instrument(5, "NIFTY24AUGFUT", Exchange::NFO, Segment::Futures),
                ],
            )
            .unwrap();
        (tmp, catalog)
    }

    #[test]
    fn prefix_matches_rank_before_substring() {
        let (_tmp, catalog) = sample_catalog();
        let (results, total) = catalog.search(&SearchQuery {
            text: Some("REL".to_string()),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(total, 3);
        assert!(results[0].trading_symbol.starts_with("REL"));

        let (results, total) = catalog.search(&SearchQuery {
            text: Some("INFRA".to_string()),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(total, 1);
        assert_eq!(results[0].trading_symbol, "RELINFRA");
    }

    #[test]
    fn token_query_matches_exactly() {
        let (_tmp, catalog) = sample_catalog();
        let (results, total) = catalog.search(&SearchQuery {
            text: Some("5".to_string()),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(total, 1);
        assert_eq!(results[0].instrument_token, 5);
    }

    #[test]
    fn filters_and_pagination() {
        let (_tmp, catalog) = sample_catalog();

        let (results, _) = catalog.search(&SearchQuery {
            exchange: Some(Exchange::NSE),
            limit: 100,
            ..Default::default()
        });
        assert_eq!(results.len(), 3);

        let (results, _) = catalog.search(&SearchQuery {
            segment: Some(Segment::Futures),
            limit: 100,
            ..Default::default()
        });
        assert_eq!(results.len(), 1);

        let (page1, total) = catalog.search(&SearchQuery {
            limit: 2,
            offset: 0,
            ..Default::default()
        });
        let (page2, _) = catalog.search(&SearchQuery {
            limit: 2,
            offset: 2,
            ..Default::default()
        });
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].instrument_token, page2[0].instrument_token);
    }

    #[test]
    fn resolve_is_exchange_scoped_and_case_insensitive() {
        let (_tmp, catalog) = sample_catalog();
        let nse = catalog
            .resolve(&InstrumentRef {
                exchange: Exchange::NSE,
                trading_symbol: "reliance".to_string(),
            })
            .unwrap();
        assert_eq!(nse.instrument_token, 1);

        let bse = catalog
            .resolve(&InstrumentRef {
                exchange: Exchange::BSE,
                trading_symbol: "RELIANCE".to_string(),
            })
            .unwrap();
        assert_eq!(bse.instrument_token, 4);

        assert!(catalog
            .resolve(&InstrumentRef {
                exchange: Exchange::MCX,
                trading_symbol: "RELIANCE".to_string(),
            })
            .is_none());
    }

    #[test]
    fn persisted_snapshot_survives_restart() {
        let (tmp, catalog) = sample_catalog();
        drop(catalog);

        let reopened = InstrumentCatalog::new(tmp.path(), "paper").unwrap();
        assert_eq!(reopened.snapshot().len(), 5);
        assert!(reopened.get_by_token(3).is_some());
    }

    #[test]
    fn staleness() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = InstrumentCatalog::new(tmp.path(), "paper").unwrap();
        assert!(catalog.is_stale(3600));

        catalog
            .replace("paper", vec![instrument(1, "X", Exchange::NSE, Segment::Equity)])
            .unwrap();
        assert!(!catalog.is_stale(3600));
    }

    #[test]
    fn search_limit_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = InstrumentCatalog::new(tmp.path(), "paper").unwrap();
        let many: Vec<Instrument> = (0..1_000)
            .map(|i| instrument(i, &format!("SYM{i:04}"), Exchange::NSE, Segment::Equity))
            .collect();
        catalog.replace("paper", many).unwrap();

        let (results, total) = catalog.search(&SearchQuery {
            limit: 10_000,
            ..Default::default()
        });
        assert_eq!(total, 1_000);
        assert_eq!(results.len(), MAX_SEARCH_LIMIT);
    }
}
