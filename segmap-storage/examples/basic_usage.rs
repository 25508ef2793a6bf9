//! Create a file-backed table, store a few entries, and reopen it.
//!
//! Run with: `cargo run --example basic_usage`

use segmap_storage::{SegmentedTable, TableConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let path = std::env::temp_dir().join("segmap-basic-usage.segmap");
    let config = TableConfig {
        segments: 8,
        chunk_size: 64,
        chunks_per_segment: 1024,
        max_chunks_per_entry: 64,
        ..TableConfig::default()
    };

    {
        let table = SegmentedTable::create(&path, &config)?;
        table.put(b"hello", b"world")?;
        table.put(b"answer", b"42")?;
        println!("stored {} entries", table.len());
    }

    // Reopen the same file; everything is still there.
    let table = SegmentedTable::open(&path, &config)?;
    if let Some(value) = table.get(b"hello")? {
        println!("hello -> {}", String::from_utf8_lossy(&value));
    }
    println!("stats: {:?}", table.stats());

    std::fs::remove_file(&path)?;
    Ok(())
}
