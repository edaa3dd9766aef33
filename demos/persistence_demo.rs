//! Walkthrough of durable storage and recovery
//!
//! This example shows:
//! - Write transactions committed through the WAL
//! - Reads against the committed snapshot
//! - Vector search over node embeddings
//! - Recovery on reopen
//!
//! Run twice to see recovery in action.

use nervusdb::{Db, DbOptions, NodeId, Value};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== NervusDB Persistence Demo ===\n");

    let path = "./demo_data";
    let options = match std::env::args().nth(1) {
        Some(config) => DbOptions::from_yaml_file(config)?,
        None => DbOptions::default(),
    };

    println!("1. Opening database at {}", path);
    let db = Db::open_with_options(path, options)?;
    let existing = db.query("MATCH (n) RETURN count(n) AS c")?;
    println!("   ✓ Recovered {} nodes\n", existing.single("c").unwrap_or(&Value::Null));

    if existing.single("c") == Some(&Value::Int(0)) {
        println!("2. Loading sample data in one transaction");
        let mut txn = db.begin_write()?;
        txn.query(
            "CREATE (a:Person {name: 'Alice', age: 30, city: 'New York'}), \
                    (b:Person {name: 'Bob', age: 25, city: 'San Francisco'}), \
                    (a)-[:KNOWS {since: 2020, strength: 0.9}]->(b)",
        )?;
        txn.set_vector(NodeId::new(0), vec![0.9, 0.1, 0.0])?;
        txn.set_vector(NodeId::new(1), vec![0.1, 0.9, 0.0])?;
        let stats = txn.stats();
        txn.commit()?;
        println!(
            "   ✓ {} nodes, {} relationships, {} properties, {} vectors\n",
            stats.nodes_created, stats.relationships_created, stats.properties_set, stats.vectors_set
        );
    } else {
        println!("2. Sample data already present, skipping load\n");
    }

    println!("3. Querying");
    let result = db.query("MATCH (a:Person)-[r:KNOWS]->(b:Person) RETURN a.name, r.since, b.name")?;
    for row in result.iter() {
        println!("   • {} knows {} since {}", row["a.name"], row["b.name"], row["r.since"]);
    }
    println!();

    println!("4. Vector search for [1.0, 0.0, 0.0]");
    let snapshot = db.snapshot()?;
    for (id, distance) in db.search_vector(&[1.0, 0.0, 0.0], 2)? {
        let name = snapshot
            .node(id)
            .and_then(|n| n.get_property("name"))
            .and_then(|v| v.as_string())
            .unwrap_or("?");
        println!("   • {} at distance {:.3}", name, distance);
    }
    println!();

    println!("5. Checkpoint and close");
    db.checkpoint()?;
    db.close()?;
    println!("   ✓ WAL truncated and storage flushed\n");

    println!("=== Demo Complete ===");
    println!("\nPersisted data structure:");
    println!("  {}/", path);
    println!("    ├── data/           (RocksDB storage)");
    println!("    └── wal/            (Write-Ahead Log)");

    Ok(())
}
