//! Offline aggregation of saved upload snapshots: for each distinct number of packets per run,
//!  how many packets arrived on average, and how much that varied.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// The subset of a saved session record that the aggregation needs. Other fields are ignored,
///  so snapshots of older tool versions can be read as well.
#[derive(Clone, Debug, Deserialize)]
pub struct SavedRecord {
    pub count: u64,
    pub packet_rate: u32,
    pub total_packets: u32,
    pub direction: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadStats {
    pub num_elements: usize,
    pub total_packets: u32,
    pub average_count: f64,
    pub standard_deviation: f64,
    pub average_packet_rate: f64,
    pub ratio: f64,
}

pub const CSV_HEADER: &str = "Number of Matching Elements;Total Packets;Average Count;Standard Deviation;Average Packet Rate;Count/Total Packets Ratio";

pub fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<BTreeMap<String, SavedRecord>> {
    let json = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&json)?)
}

/// Groups the upload records by `total_packets`, ordered by `total_packets`
pub fn aggregate_upload<'a>(records: impl IntoIterator<Item = &'a SavedRecord>) -> Vec<UploadStats> {
    let mut by_total_packets: BTreeMap<u32, Vec<&SavedRecord>> = BTreeMap::new();
    for record in records {
        if record.direction == 0 {
            by_total_packets.entry(record.total_packets)
                .or_default()
                .push(record);
        }
    }

    by_total_packets.into_iter()
        .map(|(total_packets, records)| {
            let counts = records.iter().map(|r| r.count as f64).collect::<Vec<_>>();
            let average_count = mean(&counts);
            let average_packet_rate = mean(&records.iter().map(|r| r.packet_rate as f64).collect::<Vec<_>>());
            let ratio = if total_packets > 0 {
                average_count / total_packets as f64
            }
            else {
                0.0
            };

            UploadStats {
                num_elements: records.len(),
                total_packets,
                average_count: round4(average_count),
                standard_deviation: round4(sample_standard_deviation(&counts, average_count)),
                average_packet_rate: round4(average_packet_rate),
                ratio: round4(ratio),
            }
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 0 for fewer than two values
fn sample_standard_deviation(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_of_squares = values.iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>();
    (sum_of_squares / (values.len() - 1) as f64).sqrt()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// decimal comma, as spreadsheets in many locales expect it. Averages of whole numbers are
///  written without a fractional part if they have none.
fn fmt_decimal(value: f64) -> String {
    value.to_string().replace('.', ",")
}

/// Like [fmt_decimal], but a computed fraction always has at least one decimal place ("2,0").
///  `None` is a value that could not be computed, written as a plain "0".
fn fmt_fraction(value: Option<f64>) -> String {
    match value {
        None => "0".to_string(),
        Some(v) if v.fract() == 0.0 => format!("{:.1}", v).replace('.', ","),
        Some(v) => fmt_decimal(v),
    }
}

pub fn write_csv(stats: &[UploadStats], out: &mut impl Write) -> anyhow::Result<()> {
    writeln!(out, "{}", CSV_HEADER)?;
    for s in stats {
        writeln!(out, "{};{};{};{};{};{}",
            s.num_elements,
            s.total_packets,
            fmt_decimal(s.average_count),
            fmt_fraction(Some(s.standard_deviation).filter(|_| s.num_elements >= 2)),
            fmt_decimal(s.average_packet_rate),
            fmt_fraction(Some(s.ratio).filter(|_| s.total_packets > 0)),
        )?;
    }
    Ok(())
}

/// Reads a saved snapshot and writes the aggregated upload statistics as CSV
pub fn convert(input: impl AsRef<Path>, output: impl AsRef<Path>) -> anyhow::Result<usize> {
    let snapshot = load_snapshot(input.as_ref())?;
    let stats = aggregate_upload(snapshot.values());

    let mut file = std::fs::File::create(output.as_ref())?;
    write_csv(&stats, &mut file)?;
    info!("wrote statistics for {} upload groups from {:?} to {:?}", stats.len(), input.as_ref(), output.as_ref());
    Ok(stats.len())
}
