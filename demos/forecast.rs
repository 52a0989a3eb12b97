//! Prints the MOSMIX forecast of one station as a table.
//!
//! `cargo run --example forecast -- 10865` (defaults to München-Stadt). Set `RUST_LOG=debug` to
//! see cache and download decisions.

use dwd_forecast::{Dwd, DwdError};
use std::env;

#[tokio::main]
async fn main() -> Result<(), DwdError> {
    env_logger::init();
    configure_polars_display();

    let station = env::args().nth(1).unwrap_or_else(|| "10865".to_string());
    let client = Dwd::new().await?;

    let snapshot = client.forecast().station(station.as_str()).call().await?;
    println!(
        "Forecast issued {:?}, fetched {} ({:?})",
        snapshot.product.issue_time, snapshot.fetched_at, snapshot.origin
    );

    for location in snapshot.locations() {
        println!(
            "{} {}",
            location.id,
            location.description.as_deref().unwrap_or_default()
        );
        let frame = location.series.to_dataframe()?;
        println!("{}", frame);
    }

    Ok(())
}

fn configure_polars_display() {
    // show every column
    env::set_var("POLARS_FMT_MAX_COLS", "-1");
    // show 24 rows
    env::set_var("POLARS_FMT_MAX_ROWS", "24");
}
