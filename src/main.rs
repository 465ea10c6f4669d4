use stress_test::{stress_test_compaction, stress_test_replicas, stress_test_scaling};
use tracing_subscriber::EnvFilter;


#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CINDER STRESS TESTS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: a few replicas, small history
    let stats = stress_test_replicas(3, 50, 60).await?;
    stats.print();

    // Test 2: more replicas, more syncs
    let stats = stress_test_replicas(6, 100, 200).await?;
    stats.print();

    // Test 3: commits racing compaction
    let stats = stress_test_compaction(4, 150).await?;
    stats.print();

    // Test 4: scaling
    stress_test_scaling(8, 2).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
