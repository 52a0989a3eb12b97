//! Finds the closest station with a live forecast and prints its temperature outlook.

use dwd_forecast::{Dwd, DwdError, LatLon};

#[tokio::main]
async fn main() -> Result<(), DwdError> {
    env_logger::init();

    let client = Dwd::new().await?;
    let marienplatz = LatLon(48.137, 11.575);

    let (station, distance) = client
        .nearest()
        .location(marienplatz)
        .max_candidates(20)
        .call()
        .await?;
    println!("Closest station: {} ({}) at {:.1} km", station.name, station.id, distance);

    let by_name = client.search_by_name("Zugspitze").await?;
    println!("Search 'Zugspitze': {} ({})", by_name.name, by_name.id);

    let forecast = client.get_forecast(Some(&station.id), false).await?;
    let Some(location) = forecast.location(&station.id) else {
        println!("No forecast for {}", station.id);
        return Ok(());
    };
    // TTT is the 2 m temperature in Kelvin.
    for (time, row) in location.series.rows().take(12) {
        match row.get("TTT").copied().flatten() {
            Some(kelvin) => println!("{time}  {:.1} °C", kelvin - 273.15),
            None => println!("{time}  -"),
        }
    }

    Ok(())
}
