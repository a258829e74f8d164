use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::discover::DiscoveredEntity;
use crate::fetch::WikiClient;
use crate::markup;

pub const DEFAULT_CONCURRENCY: usize = 4;

pub struct HarvestOptions {
    /// Max in-flight page fetches. Kept small so the wiki is not hammered.
    pub concurrency: usize,
    /// Skip entities that still fail after retries instead of aborting.
    pub keep_going: bool,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        HarvestOptions {
            concurrency: DEFAULT_CONCURRENCY,
            keep_going: false,
        }
    }
}

#[derive(Debug)]
pub struct HarvestStats {
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
}

struct Harvested {
    name: String,
    link: String,
    json: String,
}

struct FailedEntity {
    name: String,
    link: String,
    error: anyhow::Error,
}

type TaskResult = std::result::Result<Harvested, FailedEntity>;

/// Fetch, parse and serialize every discovered entity, appending each record
/// to `out` as it completes. Fan-out is semaphore-bounded; completions funnel
/// through a channel into the single writer below, so records land in
/// completion order, not discovery order.
///
/// The caller owns the surrounding array tokens: `out` should already hold
/// the opening `[\n`, and the closing `\n]` is only written by the caller
/// after this returns Ok.
pub async fn harvest_streaming<W: Write>(
    client: Arc<WikiClient>,
    entities: Vec<DiscoveredEntity>,
    out: &mut W,
    opts: &HarvestOptions,
) -> Result<HarvestStats> {
    let total = entities.len();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    let (tx, rx) = mpsc::channel::<TaskResult>(opts.concurrency * 2);

    for entity in entities {
        let client = Arc::clone(&client);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = sem.acquire().await.unwrap();
            let msg = match harvest_one(&client, &entity).await {
                Ok(json) => Ok(Harvested {
                    name: entity.name,
                    link: entity.link,
                    json,
                }),
                Err(error) => Err(FailedEntity {
                    name: entity.name,
                    link: entity.link,
                    error,
                }),
            };
            let _ = tx.send(msg).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish.
    drop(tx);

    drain_to_writer(out, rx, total, opts.keep_going).await
}

/// Single consumer of the completion channel. Each record goes out in one
/// `write_all` call, so concurrent completions can never interleave
/// mid-record; the file stays a valid JSON-array prefix after every append.
async fn drain_to_writer<W: Write>(
    out: &mut W,
    mut rx: mpsc::Receiver<TaskResult>,
    total: usize,
    keep_going: bool,
) -> Result<HarvestStats> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let mut written = 0usize;
    let mut skipped = 0usize;
    let mut done = 0usize;

    while let Some(result) = rx.recv().await {
        done += 1;
        match result {
            Ok(record) => {
                let line = if written == 0 {
                    record.json
                } else {
                    format!(",\n{}", record.json)
                };
                out.write_all(line.as_bytes())?;
                out.flush()?;
                written += 1;

                pb.println(format!("[{}/{}] {} ({})", done, total, record.name, record.link));
                pb.inc(1);
            }
            Err(failed) => {
                if keep_going {
                    warn!("Skipping {} ({}): {:#}", failed.name, failed.link, failed.error);
                    skipped += 1;
                    pb.inc(1);
                } else {
                    pb.finish_and_clear();
                    return Err(failed.error).with_context(|| {
                        format!("Harvest failed for {} ({})", failed.name, failed.link)
                    });
                }
            }
        }
    }

    pb.finish_and_clear();
    info!("Harvested {} of {} entities ({} skipped)", written, total, skipped);

    Ok(HarvestStats {
        total,
        written,
        skipped,
    })
}

async fn harvest_one(client: &WikiClient, entity: &DiscoveredEntity) -> Result<String> {
    let raw = client.fetch_page_source(&entity.link).await?;
    let parsed = markup::parse_page(&raw)
        .with_context(|| format!("Failed to parse page for {}", entity.name))?;
    let record = merge_metadata(parsed, entity);
    Ok(serde_json::to_string(&record)?)
}

/// Fold discovery-time classification into the parsed page. The index is the
/// authority on realm and kind, so these overwrite any same-named field the
/// page markup happens to carry.
pub fn merge_metadata(parsed: Value, entity: &DiscoveredEntity) -> Value {
    let mut map = match parsed {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("text".into(), other);
            map
        }
    };

    map.insert(
        "realms".into(),
        Value::Array(
            entity
                .realms
                .iter()
                .map(|realm| Value::String(realm.to_string()))
                .collect(),
        ),
    );
    map.insert("kind".into(), Value::String(entity.kind.to_string()));

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::{EntityKind, Realm};
    use std::io::{Read, Seek, SeekFrom};
    use std::time::Duration;

    fn record(i: usize) -> Harvested {
        Harvested {
            name: format!("entity{i}"),
            link: format!("/gmod/entity{i}"),
            json: format!("{{\"i\":{i}}}"),
        }
    }

    fn parse_with_close(prefix: &[u8]) -> Vec<Value> {
        let mut text = String::from_utf8(prefix.to_vec()).unwrap();
        text.push_str("\n]");
        let value: Value = serde_json::from_str(&text).expect("prefix + close token must be valid JSON");
        value.as_array().unwrap().clone()
    }

    #[tokio::test]
    async fn atomic_append_under_concurrency() {
        let (tx, rx) = mpsc::channel(4);
        for i in 0..8 {
            let tx = tx.clone();
            tokio::spawn(async move {
                // Stagger completions so arrival order differs from send order.
                tokio::time::sleep(Duration::from_millis((8 - i as u64) * 5)).await;
                let _ = tx.send(Ok(record(i))).await;
            });
        }
        drop(tx);

        let mut buf: Vec<u8> = b"[\n".to_vec();
        let stats = drain_to_writer(&mut buf, rx, 8, false).await.unwrap();
        assert_eq!(stats.written, 8);

        let items = parse_with_close(&buf);
        assert_eq!(items.len(), 8);
        for item in items {
            assert!(item.get("i").is_some());
        }
    }

    #[tokio::test]
    async fn prefix_is_valid_after_partial_run() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"[\n").unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(record(0))).await.unwrap();
        tx.send(Ok(record(1))).await.unwrap();
        drop(tx);

        drain_to_writer(&mut file, rx, 5, false).await.unwrap();

        let mut content = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(parse_with_close(&content).len(), 2);
    }

    #[tokio::test]
    async fn prefix_is_valid_with_zero_records() {
        let (tx, rx) = mpsc::channel::<TaskResult>(1);
        drop(tx);

        let mut buf: Vec<u8> = b"[\n".to_vec();
        drain_to_writer(&mut buf, rx, 0, false).await.unwrap();
        assert!(parse_with_close(&buf).is_empty());
    }

    #[tokio::test]
    async fn failure_aborts_by_default() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Err(FailedEntity {
            name: "broken".into(),
            link: "/gmod/broken".into(),
            error: anyhow::anyhow!("boom"),
        }))
        .await
        .unwrap();
        drop(tx);

        let mut buf: Vec<u8> = b"[\n".to_vec();
        let err = drain_to_writer(&mut buf, rx, 3, false).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        // Nothing beyond the open token was written.
        assert_eq!(buf, b"[\n");
    }

    #[tokio::test]
    async fn keep_going_skips_failures() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(record(0))).await.unwrap();
        tx.send(Err(FailedEntity {
            name: "broken".into(),
            link: "/gmod/broken".into(),
            error: anyhow::anyhow!("boom"),
        }))
        .await
        .unwrap();
        tx.send(Ok(record(1))).await.unwrap();
        drop(tx);

        let mut buf: Vec<u8> = b"[\n".to_vec();
        let stats = drain_to_writer(&mut buf, rx, 3, true).await.unwrap();
        assert_eq!(stats.written, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(parse_with_close(&buf).len(), 2);
    }

    #[test]
    fn metadata_overwrites_page_fields() {
        let entity = DiscoveredEntity {
            name: "print".into(),
            link: "/gmod/Global.print".into(),
            kind: EntityKind::Function,
            realms: vec![Realm::Server, Realm::Client],
        };
        let parsed = serde_json::json!({
            "function": {"name": "print"},
            "realms": "stale page value",
            "kind": "stale"
        });

        let merged = merge_metadata(parsed, &entity);
        assert_eq!(merged["realms"], serde_json::json!(["Server", "Client"]));
        assert_eq!(merged["kind"], "Function");
        assert_eq!(merged["function"]["name"], "print");
    }

    #[test]
    fn scalar_page_wrapped_before_merge() {
        let entity = DiscoveredEntity {
            name: "ACT".into(),
            link: "/gmod/Enums/ACT".into(),
            kind: EntityKind::Enum,
            realms: vec![],
        };

        let merged = merge_metadata(Value::String("bare text page".into()), &entity);
        assert_eq!(merged["text"], "bare text page");
        assert_eq!(merged["kind"], "Enum");
        assert_eq!(merged["realms"], serde_json::json!([]));
    }
}
