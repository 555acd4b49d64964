use chrono::NaiveDateTime;

use crate::buffer::TelemetryBuffer;
use crate::error::MonitorError;
use crate::types::Channel;

/// Charted channels only; pressure and altitude are gauge values and do
/// not appear in exports.
const CSV_HEADERS: [&str; 7] = [
    "time",
    "temperature(C)",
    "humidity(%)",
    "wind speed(m/s)",
    "illumination(lux)",
    "PM2.5(ug/m3)",
    "uv index",
];

/// Renders the current window as CSV, one row per sample in chronological
/// order. The leading BOM keeps spreadsheet imports on UTF-8.
pub fn window_to_csv(buffer: &TelemetryBuffer) -> Result<String, MonitorError> {
    if buffer.is_empty() {
        return Err(MonitorError::validation("no data to export"));
    }

    let mut out = String::from('\u{feff}');
    out.push_str(&CSV_HEADERS.join(","));
    out.push('\n');

    let columns: Vec<Vec<f64>> = Channel::CHARTED
        .iter()
        .map(|&channel| buffer.values(channel).collect())
        .collect();

    for (row, label) in buffer.labels().enumerate() {
        out.push_str(label);
        for column in &columns {
            out.push(',');
            out.push_str(&column[row].to_string());
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn export_filename(now: NaiveDateTime) -> String {
    format!("envdata_{}.csv", now.format("%Y%m%d_%H%M"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::types::TelemetryReading;
    use chrono::NaiveDate;

    fn buffer_with_samples() -> TelemetryBuffer {
        let mut buffer = TelemetryBuffer::new(BufferConfig::default());
        buffer.append_live(
            &TelemetryReading {
                temperature: Some(235),
                humidity: Some(601),
                wind_speed: Some(32),
                illumination: Some(850),
                pm25: Some(35),
                sunray: Some(52),
                ..TelemetryReading::default()
            },
            "10:30:45".to_string(),
        );
        buffer.append_live(
            &TelemetryReading {
                temperature: Some(236),
                ..TelemetryReading::default()
            },
            "10:30:50".to_string(),
        );
        buffer
    }

    #[test]
    fn csv_has_a_header_and_one_row_per_sample() {
        let csv = window_to_csv(&buffer_with_samples()).unwrap();

        assert!(csv.starts_with('\u{feff}'));
        let lines: Vec<&str> = csv.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "time,temperature(C),humidity(%),wind speed(m/s),illumination(lux),PM2.5(ug/m3),uv index"
        );
        assert_eq!(lines[1], "10:30:45,23.5,60.1,3.2,850,35,5.2");
        assert_eq!(lines[2], "10:30:50,23.6,0,0,0,0,0");
    }

    #[test]
    fn empty_window_refuses_to_export() {
        let buffer = TelemetryBuffer::new(BufferConfig::default());
        assert!(window_to_csv(&buffer).is_err());
    }

    #[test]
    fn filename_embeds_the_timestamp() {
        let now = NaiveDate::from_ymd_opt(2026, 1, 19)
            .unwrap()
            .and_hms_opt(17, 30, 0)
            .unwrap();
        assert_eq!(export_filename(now), "envdata_20260119_1730.csv");
    }
}
