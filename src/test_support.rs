//! Fixtures shared by the unit tests: a loopback axum server and builders for the
//! KML, KMZ and HTML documents DWD publishes.

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub(crate) struct Reply {
    status: StatusCode,
    body: Vec<u8>,
}

impl Reply {
    pub(crate) fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.into(),
        }
    }

    pub(crate) fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            body: Vec::new(),
        }
    }
}

type Handler = dyn Fn(&Method, &str) -> Reply + Send + Sync;

#[derive(Clone)]
struct ServerState {
    handler: Arc<Handler>,
    hits: Arc<AtomicUsize>,
}

pub(crate) struct TestServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Answers successive requests with `replies` in order, repeating the last one.
pub(crate) async fn serve(replies: Vec<Reply>) -> TestServer {
    let next = AtomicUsize::new(0);
    serve_with(move |_, _| {
        let i = next.fetch_add(1, Ordering::SeqCst);
        replies
            .get(i)
            .or_else(|| replies.last())
            .cloned()
            .unwrap_or_else(|| Reply::status(503))
    })
    .await
}

/// Answers every request with `handler(method, path)`.
pub(crate) async fn serve_with<F>(handler: F) -> TestServer
where
    F: Fn(&Method, &str) -> Reply + Send + Sync + 'static,
{
    let hits = Arc::new(AtomicUsize::new(0));
    let state = ServerState {
        handler: Arc::new(handler),
        hits: hits.clone(),
    };
    let app = Router::new().fallback(respond).with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer { addr, hits, task }
}

async fn respond(State(state): State<ServerState>, method: Method, uri: Uri) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let reply = (state.handler)(&method, uri.path());
    if method == Method::HEAD {
        reply.status.into_response()
    } else {
        (reply.status, reply.body).into_response()
    }
}

/// One placemark: identifier, description and `(elementName, value text)` pairs.
pub(crate) type PlacemarkFixture<'a> = (&'a str, &'a str, &'a [(&'a str, &'a str)]);

/// Builds a MOSMIX-shaped KML document with namespaced tags.
pub(crate) fn kml_document(timesteps: &[&str], placemarks: &[PlacemarkFixture<'_>]) -> String {
    let mut doc = String::from(
        r#"<?xml version="1.0" encoding="ISO-8859-1" standalone="yes"?>
<kml:kml xmlns:dwd="https://opendata.dwd.de/weather/lib/pointforecast_dwd_extension_V1_0.xsd" xmlns:gx="http://www.google.com/kml/ext/2.2" xmlns:xal="urn:oasis:names:tc:ciq:xsdschema:xAL:2.0" xmlns:kml="http://www.opengis.net/kml/2.2" xmlns:atom="http://www.w3.org/2005/Atom">
  <kml:Document>
    <kml:ExtendedData>
      <dwd:ProductDefinition>
        <dwd:Issuer>Deutscher Wetterdienst</dwd:Issuer>
        <dwd:ProductID>MOSMIX</dwd:ProductID>
        <dwd:GeneratingProcess>DWD MOSMIX hourly, Version 1.0</dwd:GeneratingProcess>
        <dwd:IssueTime>2024-01-15T03:00:00.000Z</dwd:IssueTime>
        <dwd:ReferencedModel>
          <dwd:Model dwd:name="ICON" dwd:referenceTime="2024-01-14T21:00:00Z"/>
          <dwd:Model dwd:name="ECMWF/IFS" dwd:referenceTime="2024-01-14T12:00:00Z"/>
        </dwd:ReferencedModel>
        <dwd:ForecastTimeSteps>
"#,
    );
    for step in timesteps {
        doc.push_str(&format!("          <dwd:TimeStep>{step}</dwd:TimeStep>\n"));
    }
    doc.push_str(
        r#"        </dwd:ForecastTimeSteps>
        <dwd:FormatCfg>
          <dwd:DefaultUndefSign>-</dwd:DefaultUndefSign>
        </dwd:FormatCfg>
      </dwd:ProductDefinition>
    </kml:ExtendedData>
"#,
    );
    for (id, description, forecasts) in placemarks {
        doc.push_str(&format!(
            "    <kml:Placemark>\n      <kml:name>{id}</kml:name>\n      <kml:description>{description}</kml:description>\n      <kml:ExtendedData>\n"
        ));
        for (element, values) in forecasts.iter() {
            doc.push_str(&format!(
                "        <dwd:Forecast dwd:elementName=\"{element}\">\n          <dwd:value>{values}</dwd:value>\n        </dwd:Forecast>\n"
            ));
        }
        doc.push_str(
            "      </kml:ExtendedData>\n      <kml:Point>\n        <kml:coordinates>11.55,48.16,521.0</kml:coordinates>\n      </kml:Point>\n    </kml:Placemark>\n",
        );
    }
    doc.push_str("  </kml:Document>\n</kml:kml>\n");
    doc
}

/// A small, valid single-station document with three hourly steps.
pub(crate) fn single_station_kml(id: &str) -> String {
    kml_document(
        &[
            "2024-01-15T04:00:00.000Z",
            "2024-01-15T05:00:00.000Z",
            "2024-01-15T06:00:00.000Z",
        ],
        &[(
            id,
            "MUENCHEN-STADT",
            &[("TTT", "273.45 274.05 -"), ("FF", "1.50 0.00 2.25")],
        )],
    )
}

/// Packs `content` as the single entry of a KMZ (ZIP) archive.
pub(crate) fn kmz(entry_name: &str, content: &[u8]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(entry_name, zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(content).unwrap();
    writer.finish().unwrap().into_inner()
}

/// One directory row: id, name, latitude, longitude, elevation, start, end, river basin.
pub(crate) type StationRow<'a> = (&'a str, &'a str, &'a str, &'a str, &'a str, &'a str, &'a str, &'a str);

/// Builds a page shaped like the DWD station lexicon: two caption rows, then the header row.
pub(crate) fn directory_html(rows: &[StationRow<'_>]) -> String {
    let mut html = String::from(
        r#"<html><body>
<table class="statlex">
<tr><th colspan="11">Stationslexikon</th></tr>
<tr><td colspan="11">Stand: heute</td></tr>
<tr><th>Stationsname</th><th>Stations_ID</th><th>Kennung</th><th>Stations-kennung</th><th>Breite</th><th>L&auml;nge</th><th>Stations-h&ouml;he</th><th>Flussgebiet</th><th>Bundesland</th><th>Beginn</th><th>Ende</th></tr>
"#,
    );
    for (i, (id, name, lat, lon, elevation, start, end, basin)) in rows.iter().enumerate() {
        html.push_str(&format!(
            "<tr><td>{name}</td><td>{}</td><td>SY</td><td>{id}</td><td>{lat}</td><td>{lon}</td><td>{elevation}</td><td>{basin}</td><td>BY</td><td>{start}</td><td>{end}</td></tr>\n",
            1000 + i
        ));
    }
    html.push_str("</table></body></html>\n");
    html
}
