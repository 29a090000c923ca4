use chrono::{Duration, NaiveDate, TimeZone, Utc};
use pvoutput_backfill::fetcher::FetchUnit;
use pvoutput_backfill::resume::{MissingRange, ResumeError, ResumeState, UnitFailure};
use pvoutput_backfill::{DateSpan, SystemId};
use tempfile::TempDir;

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 11, day).unwrap()
}

fn state() -> ResumeState {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    ResumeState::new(SystemId::new(6112), DateSpan::new(d(1), d(30)).unwrap(), now)
}

#[test]
fn fresh_state_omits_cursor_on_disk() {
    let json = serde_json::to_value(state()).unwrap();
    assert!(json.get("cursor").is_none());
    assert_eq!(json["system_id"], 6112);
    assert_eq!(json["schema_version"], "1.0.0");
}

#[test]
fn counters_accumulate_and_failures_replace() {
    let mut state = state();
    let later = state.created_at() + Duration::minutes(5);
    state.record_unit(288, later);
    state.record_unit(0, later);
    assert_eq!(state.metadata().total_units(), 2);
    assert_eq!(state.metadata().total_records(), 288);
    assert_eq!(state.updated_at(), later);

    let unit = FetchUnit::TimeSeries {
        system_id: SystemId::new(6112),
        date: d(3),
    };
    let failure = UnitFailure {
        unit: unit.clone(),
        cause: "bad gateway".to_string(),
        attempts: 5,
        failed_at: later,
    };
    state.record_failure(failure.clone());
    state.record_failure(UnitFailure {
        attempts: 6,
        ..failure
    });
    assert_eq!(state.failed_units().len(), 1);
    assert_eq!(state.failed_units()[0].attempts, 6);
    assert_eq!(state.metadata().total_failures(), 2);

    assert!(state.clear_failure(&unit));
    assert!(!state.clear_failure(&unit));
}

#[test]
fn saved_state_loads_back_with_ledger() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("6112.json");

    let mut state = state();
    state.set_cursor(Some(d(12)));
    state.set_missing_ranges(vec![MissingRange {
        start: d(4),
        end: d(6),
        first_observed: state.created_at(),
    }]);
    state.set_metadata_fetched();
    state.save(&path).unwrap();

    let loaded = ResumeState::load(&path).unwrap();
    assert_eq!(loaded, state);
    assert!(loaded.verify().is_ok());
}

#[test]
fn overlapping_ranges_fail_verification() {
    let mut state = state();
    let at = state.created_at();
    state.set_missing_ranges(vec![
        MissingRange {
            start: d(4),
            end: d(8),
            first_observed: at,
        },
        MissingRange {
            start: d(8),
            end: d(9),
            first_observed: at,
        },
    ]);
    assert!(matches!(state.verify(), Err(ResumeError::Inconsistent(_))));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let result = ResumeState::load(&dir.path().join("absent.json"));
    assert!(matches!(result, Err(ResumeError::IoError(_))));
}
