//! Parsers for PVOutput's text responses
//!
//! PVOutput answers in loosely structured text rather than JSON:
//!
//! - `getstatus` (history): `;`-separated rows of `date,time,v1,...,v9`
//! - `getbatchstatus`: one line per date, `date;time,v1,..,v4;time,v1,..,v4`
//! - `getsystem`: one `,`-separated record, followed by optional `;` sections
//! - `getstatistic`: one `,`-separated record
//! - `search`: newline-separated `,`-separated records
//!
//! Missing measurements appear as `NaN` or an empty field and become `None`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use super::pvoutput_config::DATE_FORMAT;
use super::{FetcherError, FetcherResult};
use crate::{SearchResult, StatusRecord, SystemId, SystemMetadata, SystemStatistic};

/// Columns of a historic `getstatus` row after date and time.
const STATUS_VALUE_COLUMNS: usize = 9;

/// Columns of a batch row after time. More means consumption data.
const BATCH_VALUE_COLUMNS: usize = 4;

/// Parse a `YYYYMMDD` date.
pub fn parse_date(value: &str) -> FetcherResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|e| FetcherError::ParseError(format!("invalid date '{value}': {e}")))
}

/// Format a date for query parameters.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_time(value: &str) -> FetcherResult<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| FetcherError::ParseError(format!("invalid time '{value}': {e}")))
}

fn parse_float(value: &str) -> FetcherResult<Option<f64>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let parsed: f64 = value
        .parse()
        .map_err(|_| FetcherError::ParseError(format!("invalid number '{value}'")))?;
    Ok(parsed.is_finite().then_some(parsed))
}

fn parse_count(value: &str) -> FetcherResult<Option<u32>> {
    Ok(parse_float(value)?.map(|v| v.max(0.0).round() as u32))
}

fn parse_optional_date(value: &str) -> FetcherResult<Option<NaiveDate>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    parse_date(value).map(Some)
}

/// Parse the body of a historic `getstatus` call.
pub fn parse_status_history(body: &str) -> FetcherResult<Vec<StatusRecord>> {
    let mut records = Vec::new();

    for row in body.split(';').map(str::trim).filter(|r| !r.is_empty()) {
        let fields: Vec<&str> = row.split(',').collect();
        if fields.len() < 2 || fields.len() > 2 + STATUS_VALUE_COLUMNS {
            return Err(FetcherError::ParseError(format!(
                "status row has {} fields: '{row}'",
                fields.len()
            )));
        }

        let datetime = NaiveDateTime::new(parse_date(fields[0])?, parse_time(fields[1])?);
        let mut values = [None; STATUS_VALUE_COLUMNS];
        for (slot, raw) in values.iter_mut().zip(&fields[2..]) {
            *slot = parse_float(raw)?;
        }

        records.push(StatusRecord {
            datetime,
            cumulative_energy_gen_wh: values[0],
            energy_efficiency_kwh_per_kw: values[1],
            instantaneous_power_gen_w: values[2],
            average_power_gen_w: values[3],
            power_gen_normalised: values[4],
            energy_consumption_wh: values[5],
            power_demand_w: values[6],
            temperature_c: values[7],
            voltage: values[8],
        });
    }

    records.sort_by_key(|r| r.datetime);
    Ok(records)
}

/// Parse the body of a data service `getbatchstatus` call.
///
/// Consumption columns are not supported and yield
/// [`FetcherError::UnsupportedData`].
pub fn parse_batch_status(body: &str) -> FetcherResult<Vec<StatusRecord>> {
    let mut records = Vec::new();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut sections = line.split(';');
        let date = match sections.next() {
            Some(date) => parse_date(date)?,
            None => continue,
        };

        for payload in sections.map(str::trim).filter(|p| !p.is_empty()) {
            let fields: Vec<&str> = payload.split(',').collect();
            if fields.len() > 1 + BATCH_VALUE_COLUMNS {
                return Err(FetcherError::UnsupportedData(format!(
                    "batch status with {} columns includes consumption data",
                    fields.len() + 1
                )));
            }

            let mut record = StatusRecord::empty(NaiveDateTime::new(date, parse_time(fields[0])?));
            let mut values = [None; BATCH_VALUE_COLUMNS];
            for (slot, raw) in values.iter_mut().zip(&fields[1..]) {
                *slot = parse_float(raw)?;
            }
            record.cumulative_energy_gen_wh = values[0];
            record.instantaneous_power_gen_w = values[1];
            record.temperature_c = values[2];
            record.voltage = values[3];
            records.push(record);
        }
    }

    records.sort_by_key(|r| r.datetime);
    Ok(records)
}

fn first_record(body: &str, terminator: u8) -> FetcherResult<Option<csv::StringRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(csv::Terminator::Any(terminator))
        .from_reader(body.as_bytes());
    reader
        .records()
        .next()
        .transpose()
        .map_err(|e| FetcherError::ParseError(e.to_string()))
}

fn text(record: &csv::StringRecord, index: usize) -> String {
    record.get(index).unwrap_or_default().trim().to_string()
}

fn float(record: &csv::StringRecord, index: usize) -> FetcherResult<Option<f64>> {
    parse_float(record.get(index).unwrap_or_default())
}

fn count(record: &csv::StringRecord, index: usize) -> FetcherResult<Option<u32>> {
    parse_count(record.get(index).unwrap_or_default())
}

fn date(record: &csv::StringRecord, index: usize) -> FetcherResult<Option<NaiveDate>> {
    parse_optional_date(record.get(index).unwrap_or_default())
}

/// Parse the body of a `getsystem` call.
pub fn parse_metadata(system_id: SystemId, body: &str) -> FetcherResult<SystemMetadata> {
    let record = first_record(body.trim(), b';')?
        .ok_or_else(|| FetcherError::ParseError("empty metadata response".to_string()))?;

    Ok(SystemMetadata {
        system_id,
        name: text(&record, 0),
        system_dc_capacity_w: float(&record, 1)?,
        address: text(&record, 2),
        num_panels: count(&record, 3)?,
        panel_capacity_w_each: float(&record, 4)?,
        panel_brand: text(&record, 5),
        num_inverters: count(&record, 6)?,
        inverter_capacity_w: float(&record, 7)?,
        inverter_brand: text(&record, 8),
        orientation: text(&record, 9),
        array_tilt_degrees: float(&record, 10)?,
        shade: text(&record, 11),
        install_date: date(&record, 12)?,
        latitude: float(&record, 13)?,
        longitude: float(&record, 14)?,
        status_interval_minutes: count(&record, 15)?,
        secondary_num_panels: count(&record, 16)?,
        secondary_panel_capacity_w_each: float(&record, 17)?,
        secondary_orientation: text(&record, 18),
        secondary_array_tilt_degrees: float(&record, 19)?,
    })
}

/// Parse the body of a `getstatistic` call. An empty body yields `None`.
pub fn parse_statistic(system_id: SystemId, body: &str) -> FetcherResult<Option<SystemStatistic>> {
    let Some(record) = first_record(body.trim(), b'\n')? else {
        return Ok(None);
    };

    Ok(Some(SystemStatistic {
        system_id,
        total_energy_gen_wh: float(&record, 0)?,
        energy_exported_wh: float(&record, 1)?,
        average_daily_energy_gen_wh: float(&record, 2)?,
        minimum_daily_energy_gen_wh: float(&record, 3)?,
        maximum_daily_energy_gen_wh: float(&record, 4)?,
        average_efficiency_kwh_per_kw: float(&record, 5)?,
        num_outputs: count(&record, 6)?,
        actual_date_from: date(&record, 7)?,
        actual_date_to: date(&record, 8)?,
        record_efficiency_kwh_per_kw: float(&record, 9)?,
        record_efficiency_date: date(&record, 10)?,
    }))
}

/// Parse the body of a `search` call.
pub fn parse_search(body: &str) -> FetcherResult<Vec<SearchResult>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.trim().as_bytes());

    let mut results = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| FetcherError::ParseError(e.to_string()))?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let system_id = SystemId::parse(record.get(6).unwrap_or_default())
            .map_err(|e| FetcherError::ParseError(e.to_string()))?;

        results.push(SearchResult {
            system_id,
            name: text(&record, 0),
            system_dc_capacity_w: float(&record, 1)?,
            address: text(&record, 2),
            orientation: text(&record, 3),
            num_outputs: count(&record, 4)?,
            last_output: text(&record, 5),
            panel: text(&record, 7),
            inverter: text(&record, 8),
            distance_km: float(&record, 9)?,
            latitude: float(&record, 10)?,
            longitude: float(&record, 11)?,
        });
    }
    Ok(results)
}
