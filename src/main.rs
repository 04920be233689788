use std::env;

use virtual_map::{VirtualMap, VirtualMapConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().format_timestamp_secs().init();

    println!("🌳 Virtual Map - Starting...");
    println!("================================\n");

    let data_dir = env::var("VIRTUAL_MAP_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let flush_interval: u64 = env::var("VIRTUAL_MAP_FLUSH_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);

    println!("📋 Configuration:");
    println!("   Data Directory: {data_dir}");
    println!("   Flush Interval: {flush_interval}");
    println!();

    let config = VirtualMapConfig::new(&data_dir).with_flush_interval(flush_interval);

    println!("🌳 Opening virtual map...");
    let map: VirtualMap<Vec<u8>, Vec<u8>> = VirtualMap::open(config)?;
    println!("✅ Map ready (recovered size: {})\n", map.state().size);

    run_demo(map)?;

    Ok(())
}

fn run_demo(map: VirtualMap<Vec<u8>, Vec<u8>>) -> Result<(), Box<dyn std::error::Error>> {
    println!("═══════════════════════════════════════════════════════════════");
    println!("🔬 PUT / COPY / HASH DEMO");
    println!("═══════════════════════════════════════════════════════════════\n");

    let mut current = map;
    let accounts = [
        ("alice", "100"),
        ("bob", "200"),
        ("carol", "300"),
        ("dave", "400"),
        ("erin", "500"),
    ];

    for (i, (key, value)) in accounts.iter().enumerate() {
        current.put(key.as_bytes().to_vec(), value.as_bytes().to_vec())?;
        println!(
            "  Inserted {key}={value} (tree size: {})",
            current.state().size
        );

        if i % 2 == 1 {
            let next = current.copy()?;
            println!("  -> sealed version {}", current.version());
            current = next;
        }
    }

    let sealed = current;
    let _next = sealed.copy()?;
    println!("\nWaiting for the pipeline to flush version {}...", sealed.version());
    sealed.wait_until_flushed()?;
    println!("✅ Flushed. Root hash: {}", sealed.root_hash()?);

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Reading back every key...\n");
    for (key, value) in accounts.iter() {
        let got = sealed.get(&key.as_bytes().to_vec())?;
        let got = got.map(|v| String::from_utf8_lossy(&v).into_owned());
        println!("  {key} -> {got:?} (expected {value})");
    }

    println!("\n═══════════════════════════════════════════════════════════════\n");
    Ok(())
}
