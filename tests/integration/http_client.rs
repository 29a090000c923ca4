//! PvOutputClient against a mock PVOutput server

use chrono::{NaiveDate, TimeZone, Utc};
use httpmock::{Method::GET, MockServer};
use pvoutput_backfill::fetcher::pvoutput_config::Credentials;
use pvoutput_backfill::fetcher::{FetchOutcome, FetchUnit, Payload, ProviderClient, PvOutputClient};
use pvoutput_backfill::{DateSpan, SystemId};

const RESET: i64 = 1_704_070_800; // 2024-01-01T01:00:00Z

fn client(server: &MockServer, data_service: bool) -> PvOutputClient {
    let credentials = Credentials::new("secret-key", "1234", None).unwrap();
    let client = PvOutputClient::new(credentials)
        .unwrap()
        .with_base_url(server.base_url());
    if data_service {
        client.with_data_service_url(server.base_url())
    } else {
        client
    }
}

fn day(date: NaiveDate) -> FetchUnit {
    FetchUnit::TimeSeries {
        system_id: SystemId::new(6112),
        date,
    }
}

fn june(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 6, d).unwrap()
}

#[tokio::test]
async fn test_status_history_with_quota_headers() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatus.jsp")
                .query_param("d", "20230601")
                .query_param("h", "1")
                .query_param("sid1", "6112")
                .header("X-Pvoutput-Apikey", "secret-key")
                .header("X-Pvoutput-SystemId", "1234")
                .header("X-Rate-Limit", "1");
            then.status(200)
                .header("X-Rate-Limit-Remaining", "41")
                .header("X-Rate-Limit-Limit", "60")
                .header("X-Rate-Limit-Reset", RESET.to_string())
                .body("20230601,10:05,120,0.03,600,580,0.13,NaN,NaN,21.5,241.2;20230601,10:00,60,0.01,550,540,0.12,NaN,NaN,21.0,240.8");
        })
        .await;

    let response = client(&server, false).fetch(&day(june(1))).await;

    mock.assert_async().await;
    let quota = response.quota.unwrap();
    assert_eq!(quota.remaining, 41);
    assert_eq!(quota.limit, 60);
    assert_eq!(quota.reset_at, Utc.timestamp_opt(RESET, 0).unwrap());

    let FetchOutcome::Data(Payload::Status(rows)) = response.outcome else {
        panic!("expected status rows");
    };
    assert_eq!(rows.len(), 2);
    assert!(rows[0].datetime < rows[1].datetime);
    assert_eq!(rows[1].instantaneous_power_gen_w, Some(600.0));
    assert_eq!(rows[1].energy_consumption_wh, None);
}

#[tokio::test]
async fn test_no_status_found_is_empty() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/service/r2/getstatus.jsp");
            then.status(400).body("Bad request 400: No status found");
        })
        .await;

    let response = client(&server, false).fetch(&day(june(2))).await;
    assert_eq!(response.outcome, FetchOutcome::Empty);
}

#[tokio::test]
async fn test_exceeded_requests_is_rate_limited() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/service/r2/getstatus.jsp");
            then.status(403)
                .header("X-Rate-Limit-Remaining", "0")
                .header("X-Rate-Limit-Limit", "60")
                .header("X-Rate-Limit-Reset", RESET.to_string())
                .body("Forbidden 403: Exceeded 60 requests per hour");
        })
        .await;

    let response = client(&server, false).fetch(&day(june(3))).await;
    assert_eq!(
        response.outcome,
        FetchOutcome::RateLimited {
            reset_at: Some(Utc.timestamp_opt(RESET, 0).unwrap())
        }
    );
}

#[tokio::test]
async fn test_invalid_key_is_permanent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/service/r2/getstatus.jsp");
            then.status(401).body("Unauthorized 401: Invalid API Key");
        })
        .await;

    let response = client(&server, false).fetch(&day(june(4))).await;
    assert!(matches!(response.outcome, FetchOutcome::PermanentError(ref m) if m.contains("Invalid API Key")));
}

#[tokio::test]
async fn test_server_error_and_garbage_are_transient() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatus.jsp")
                .query_param("d", "20230605");
            then.status(503).body("Service Unavailable");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatus.jsp")
                .query_param("d", "20230606");
            then.status(200).body("<html>maintenance</html>");
        })
        .await;

    let client = client(&server, false);
    assert!(matches!(
        client.fetch(&day(june(5))).await.outcome,
        FetchOutcome::TransientError(_)
    ));
    assert!(matches!(
        client.fetch(&day(june(6))).await.outcome,
        FetchOutcome::TransientError(_)
    ));
}

#[tokio::test]
async fn test_unreachable_host_is_transient() {
    let credentials = Credentials::new("secret-key", "1234", None).unwrap();
    let client = PvOutputClient::new(credentials)
        .unwrap()
        .with_base_url("http://127.0.0.1:9");
    let response = client.fetch(&day(june(1))).await;
    assert!(matches!(response.outcome, FetchOutcome::TransientError(_)));
    assert_eq!(response.quota, None);
}

#[tokio::test]
async fn test_batch_status_request_and_filtering() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/data/r2/getbatchstatus.jsp")
                .query_param("key", "secret-key")
                .query_param("sid", "1234")
                .query_param("sid1", "6112")
                .query_param("dt", "20230610");
            then.status(200).body(
                "20230531;12:00,10,100,20.0,240.0\n\
                 20230601;12:00,20,200,21.0,241.0\n\
                 20230610;12:00,30,300,22.0,242.0",
            );
        })
        .await;

    let unit = FetchUnit::BatchStatus {
        system_id: SystemId::new(6112),
        span: DateSpan::new(june(1), june(10)).unwrap(),
    };
    let response = client(&server, true).fetch(&unit).await;

    mock.assert_async().await;
    let FetchOutcome::Data(Payload::Status(rows)) = response.outcome else {
        panic!("expected status rows");
    };
    let dates: Vec<_> = rows.iter().map(|r| r.date()).collect();
    assert_eq!(dates, vec![june(1), june(10)]);
}

#[tokio::test]
async fn test_batch_accepted_and_missing_data_service() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/data/r2/getbatchstatus.jsp");
            then.status(200).body("Accepted 202: The request has been accepted for processing");
        })
        .await;

    let unit = FetchUnit::BatchStatus {
        system_id: SystemId::new(6112),
        span: DateSpan::single(june(1)),
    };
    assert_eq!(client(&server, true).fetch(&unit).await.outcome, FetchOutcome::Accepted);
    assert!(matches!(
        client(&server, false).fetch(&unit).await.outcome,
        FetchOutcome::PermanentError(_)
    ));
}

#[tokio::test]
async fn test_latin1_metadata() {
    let server = MockServer::start_async().await;
    let mut body = b"Caf".to_vec();
    body.push(0xE9); // é in ISO-8859-1
    body.extend_from_slice(
        b" Roof,4500,2000,18,250,Brand,1,5000,Inverter,N,20.0,No,20150101,-33.8,151.2,5,0,0,,;0;",
    );
    server
        .mock_async(move |when, then| {
            when.method(GET)
                .path("/service/r2/getsystem.jsp")
                .query_param("sid1", "6112");
            then.status(200).body(body.clone());
        })
        .await;

    let unit = FetchUnit::Metadata {
        system_id: SystemId::new(6112),
    };
    let response = client(&server, false).fetch(&unit).await;
    let FetchOutcome::Data(Payload::Metadata(meta)) = response.outcome else {
        panic!("expected metadata");
    };
    assert_eq!(meta.name, "Café Roof");
    assert_eq!(meta.system_dc_capacity_w, Some(4500.0));
}

#[tokio::test]
async fn test_search_and_statistic() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/search.jsp")
                .query_param("q", "2000");
            then.status(200).body(
                "PV Site,3000,Australia 2000,N,250,2 days ago,6112,Panel A,Inverter B,1.2,-33.86,151.2",
            );
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatistic.jsp")
                .query_param("sid1", "6112");
            then.status(200)
                .body("12345,0,2500,0,5000,0.833,100,20180101,20181231,1.5,20180615");
        })
        .await;

    let client = client(&server, false);
    let results = client.search("2000", None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].system_id, SystemId::new(6112));

    let statistic = client
        .get_statistic(SystemId::new(6112), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        statistic.data_span(),
        Some(
            DateSpan::new(
                NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2018, 12, 31).unwrap()
            )
            .unwrap()
        )
    );
}

#[tokio::test]
async fn test_search_near_sends_coordinates() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/search.jsp")
                .query_param("q", "2000")
                .query_param("ll", "-33.860000,151.210000");
            then.status(200).body(
                "PV Site,3000,Australia 2000,N,250,2 days ago,6112,Panel A,Inverter B,1.2,-33.86,151.2",
            );
        })
        .await;

    let results = client(&server, false)
        .search("2000", Some((-33.86, 151.21)))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(results[0].distance_km, Some(1.2));
}

#[tokio::test]
async fn test_statistic_unit_and_request_timeout() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatistic.jsp")
                .query_param("sid1", "6112");
            then.status(200)
                .body("12345,0,2500,0,5000,0.833,300,20180101,20181231,1.5,20180615");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/service/r2/getstatistic.jsp")
                .query_param("sid1", "4232");
            then.status(408).body("Request Timeout");
        })
        .await;

    let client = client(&server, false);
    let unit = FetchUnit::Statistic {
        system_id: SystemId::new(6112),
    };
    let FetchOutcome::Data(Payload::Statistic(statistic)) = client.fetch(&unit).await.outcome else {
        panic!("expected a statistic");
    };
    assert_eq!(statistic.num_outputs, Some(300));
    assert_eq!(statistic.data_span().map(|s| s.days()), Some(365));

    // A timeout from the provider or a proxy is worth retrying
    let unit = FetchUnit::Statistic {
        system_id: SystemId::new(4232),
    };
    assert!(matches!(
        client.fetch(&unit).await.outcome,
        FetchOutcome::TransientError(_)
    ));
}
