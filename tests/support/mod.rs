#![allow(dead_code)]

use beaconvec::{Config, Pipeline, ReadingSource, Result, RunSummary, VectorRecord};
use serde_json::json;

pub const SAMPLE_ANTENNAS: [i64; 6] = [101, 102, 103, 104, 105, 106];

#[derive(Debug, Clone)]
pub struct Reading {
    pub beacon: i64,
    pub antenna: i64,
    pub dbm: f64,
    pub timestamp: String,
}

pub fn reading(beacon: i64, antenna: i64, dbm: f64, timestamp: &str) -> Reading {
    Reading { beacon, antenna, dbm, timestamp: timestamp.to_string() }
}

/// The seven readings of the sample data set.
pub fn sample() -> Vec<Reading> {
    vec![
        reading(101, 101, -77.80792406374334, "1999-06-17 00:11:00"),
        reading(303, 101, -46.17761120301083, "1999-06-17 00:12:00"),
        reading(101, 103, -68.74636830519334, "1999-06-17 00:11:00"),
        reading(303, 102, -84.76679099514944, "1999-06-17 00:12:00"),
        reading(101, 105, -19.698948991976884, "1999-06-17 00:11:00"),
        reading(303, 104, -68.58154321681343, "1999-06-17 00:12:00"),
        reading(101, 106, -53.139973206690684, "1999-06-17 00:11:00"),
    ]
}

pub fn sample_config() -> Config {
    Config { antennas: SAMPLE_ANTENNAS.to_vec(), ..Config::default() }
}

/// JSON array with one object per line, the layout the sensor export uses.
pub fn json_array(readings: &[Reading]) -> String {
    let lines: Vec<String> = readings
        .iter()
        .map(|r| {
            json!({
                "BeaconId": r.beacon,
                "ant_id": r.antenna,
                "dbm_ant": r.dbm,
                "timestamp": r.timestamp,
            })
            .to_string()
        })
        .collect();
    format!("[\n{}\n]\n", lines.join(",\n"))
}

pub fn run_sequential(config: Config, input: &str) -> Result<(RunSummary, Vec<VectorRecord>)> {
    Pipeline::new(config)?.run_blocking(ReadingSource::new(input.as_bytes()), Vec::new())
}

pub async fn run_async(config: Config, input: String) -> Result<(RunSummary, Vec<VectorRecord>)> {
    let source = ReadingSource::new(std::io::Cursor::new(input.into_bytes()));
    Pipeline::new(config)?.run(source, Vec::new()).await
}

/// (label, vector) pairs, the part of a record that reaches the report.
pub fn rendered(records: &[VectorRecord]) -> Vec<(String, Vec<f64>)> {
    records.iter().map(|r| (r.beacon.clone(), r.vector.clone())).collect()
}
