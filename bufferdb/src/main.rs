use bufferdb::{BufferedBTree, IndexConfig, TreeError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SCENARIO_KEYS: [u64; 10] = [10, 5, 3, 7, 12, 11, 15, 14, 17, 20];

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bufferdb=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match IndexConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: buffer_size={}, num_partitions={}, storage_path={}, strategy={}",
        config.buffer_size,
        config.num_partitions,
        config.storage_path.display(),
        config.strategy
    );

    if let Err(e) = run(config) {
        tracing::error!("Scenario failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: IndexConfig) -> Result<(), TreeError> {
    let tree: BufferedBTree<u64, String> = BufferedBTree::with_config(config)?;

    for key in SCENARIO_KEYS {
        tree.insert(key, format!("Value{key}"))?;
    }
    tracing::info!("Inserted {} keys, height {}", tree.len(), tree.height()?);

    for key in [7, 8] {
        match tree.search(&key)? {
            Some(value) => tracing::info!("search({key}) = {value}"),
            None => tracing::info!("search({key}) = not found"),
        }
    }

    for key in [3, 10] {
        let removed = tree.delete(&key)?;
        tracing::info!("delete({key}) removed={removed}");
    }
    for key in [3, 10, 5] {
        tracing::info!("search({key}) = {:?}", tree.search(&key)?);
    }

    tree.flush()?;
    tree.check_invariants()?;
    tracing::info!(
        "Flushed to {}; {} entries remain in the tree",
        tree.store().storage_path().display(),
        tree.len()
    );
    Ok(())
}
