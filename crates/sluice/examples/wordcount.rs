//! Word count over a local text file.
//!
//! Usage: wordcount <textio-path>
//!
//! Reads lines, splits them into words, counts per word in a sharded sum
//! table, and prints the counts sorted by frequency.

use std::sync::Arc;

use async_trait::async_trait;
use sluice::{
    run_batch_on, BatchSpec, Deadline, Hub, MemTable, Processor, Record, Result, Sum, TableSpec,
    TopicId, Value,
};

struct LineSplitter {
    hub: Arc<Hub>,
    output: TopicId,
}

#[async_trait]
impl Processor for LineSplitter {
    async fn feed(&self, record: Record) -> Result<()> {
        let line = record.value.as_str()?.to_string();
        for word in line.split_whitespace() {
            self.hub
                .publish(&self.output, Record::new(word.to_lowercase(), 1.0))
                .await;
        }
        Ok(())
    }

    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "STDIN".to_string());
    let input = format!("textio:{}", path).parse()?;

    let hub = Arc::new(Hub::new("wordcount"));
    let lines = TopicId::from("lines");
    let words = TopicId::from("words");

    let counts = Arc::new(MemTable::new(
        TableSpec::new("counts", Sum::factory()).num_shards(16),
    ));
    hub.register(counts.clone(), std::slice::from_ref(&words));
    hub.register(
        Arc::new(LineSplitter {
            hub: hub.clone(),
            output: words,
        }),
        std::slice::from_ref(&lines),
    );

    run_batch_on(
        hub,
        vec![BatchSpec::new(input, lines).num_workers(4)],
    )
    .await;

    let result = counts.finalize(&Deadline::none()).await?;
    let map = match &result {
        Some(value) => value.as_map()?,
        None => return Ok(()),
    };
    let mut entries: Vec<_> = map
        .iter()
        .map(|(word, count)| (word.as_str(), count.as_metric().unwrap_or(0.0)))
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));
    for (word, count) in entries {
        println!("{:8.0} {}", count, word);
    }
    Ok(())
}
