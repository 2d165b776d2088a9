use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{NaiveDate, NaiveTime, Weekday};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use appointment_cell::models::{PatientFacts, Specialty, WorkingWindow};
use appointment_cell::router::appointment_routes;
use appointment_cell::services::audit::RecordingAuditSink;
use appointment_cell::store::{AppointmentStore, ConsentDirectory, InMemorySchedulingStore};
use appointment_cell::{SchedulingService, SchedulingSettings};
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

struct TestApp {
    router: Router,
    config: TestConfig,
    professional_id: Uuid,
    patient_id: Uuid,
}

async fn test_app() -> TestApp {
    let store = Arc::new(InMemorySchedulingStore::new());
    let professional_id = Uuid::new_v4();
    let patient_id = Uuid::new_v4();

    store.add_professional(professional_id, [Specialty::GeneralDentistry]).await;
    store
        .set_working_hours(
            professional_id,
            Weekday::Mon,
            vec![WorkingWindow::new(
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            )],
        )
        .await;
    store
        .add_patient(PatientFacts {
            id: patient_id,
            birth_date: NaiveDate::from_ymd_opt(1990, 2, 2),
        })
        .await;

    let consents: Arc<dyn ConsentDirectory> = store.clone();
    let appointments: Arc<dyn AppointmentStore> = store;
    let scheduling = Arc::new(SchedulingService::new(
        appointments,
        consents,
        Arc::new(RecordingAuditSink::new()),
        SchedulingSettings::default(),
    ));

    let config = TestConfig::default();
    TestApp {
        router: appointment_routes(config.to_arc(), scheduling),
        config,
        professional_id,
        patient_id,
    }
}

impl TestApp {
    async fn send(&self, user: &TestUser, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, JwtTestUtils::bearer(user, &self.config.jwt_secret));

        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn booking(&self, start: &str) -> Value {
        json!({
            "patient_id": self.patient_id,
            "professional_id": self.professional_id,
            "room_id": null,
            "start_time": start,
            "estimated_duration_minutes": 30,
            "appointment_type": "general_consult"
        })
    }
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let app = test_app().await;

    let request = Request::builder()
        .method("GET")
        .uri("/search")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_returns_created_appointment() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");

    let (status, body) = app
        .send(&receptionist, "POST", "/", Some(app.booking("2024-06-03T09:00:00Z")))
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["appointment"]["status"], "scheduled");
    assert_eq!(body["appointment"]["end_time"], "2024-06-03T09:30:00Z");
}

#[tokio::test]
async fn overlapping_create_returns_conflict_body() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");
    let (_, first) = app
        .send(&receptionist, "POST", "/", Some(app.booking("2024-06-03T09:15:00Z")))
        .await;

    let (status, body) = app
        .send(&receptionist, "POST", "/", Some(app.booking("2024-06-03T09:00:00Z")))
        .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "OVERLAP");
    assert_eq!(
        body["error"]["details"]["conflicts"]["professional"][0]["id"],
        first["appointment"]["id"]
    );
}

#[tokio::test]
async fn unavailable_slot_returns_reason_code() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");

    let (status, body) = app
        .send(&receptionist, "POST", "/", Some(app.booking("2024-06-04T09:00:00Z")))
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "NO_WORKING_DAY");
}

#[tokio::test]
async fn transition_and_detail_flow() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");
    let professional = TestUser::professional("dentist@clinic.test");

    let (_, created) = app
        .send(&receptionist, "POST", "/", Some(app.booking("2024-06-03T10:00:00Z")))
        .await;
    let id = created["appointment"]["id"].as_i64().unwrap();

    let (status, body) = app
        .send(
            &receptionist,
            "POST",
            &format!("/{}/transitions", id),
            Some(json!({ "action": "confirm", "expected_version": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["status"], "confirmed");

    let (status, body) = app
        .send(
            &receptionist,
            "POST",
            &format!("/{}/transitions", id),
            Some(json!({ "action": "complete" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, body) = app.send(&professional, "GET", &format!("/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["version"], 2);
    assert_eq!(body["consent"]["blocks_start"], false);
    assert_eq!(
        body["allowed_actions"],
        json!(["check_in", "start", "cancel", "no_show"])
    );
}

#[tokio::test]
async fn reschedule_endpoint_returns_both_sides() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");

    let (_, created) = app
        .send(&receptionist, "POST", "/", Some(app.booking("2024-06-03T11:00:00Z")))
        .await;
    let id = created["appointment"]["id"].as_i64().unwrap();

    let (status, body) = app
        .send(
            &receptionist,
            "POST",
            &format!("/{}/reschedule", id),
            Some(json!({ "new_start_time": "2024-06-03T15:00:00Z", "new_duration_minutes": 45 })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"]["status"], "cancelled");
    assert_eq!(body["created"]["rescheduled_from_id"], id);
    assert_eq!(body["created"]["end_time"], "2024-06-03T15:45:00Z");
}

#[tokio::test]
async fn search_endpoint_parses_filters() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");
    for start in ["2024-06-03T09:00:00Z", "2024-06-03T10:00:00Z"] {
        app.send(&receptionist, "POST", "/", Some(app.booking(start))).await;
    }

    let (status, body) = app
        .send(
            &receptionist,
            "GET",
            &format!("/search?professional_id={}&status=scheduled,confirmed&limit=1", app.professional_id),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["appointments"].as_array().unwrap().len(), 1);

    let (status, body) = app
        .send(&receptionist, "GET", "/search?status=pending", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn unrecognized_role_cannot_search() {
    let app = test_app().await;
    let visitor = TestUser::new("visitor@clinic.test", "visitor");

    let (status, body) = app.send(&visitor, "GET", "/search", None).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn conflict_check_endpoint_reports_bookability() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");

    let (status, body) = app
        .send(
            &receptionist,
            "POST",
            "/conflicts/check",
            Some(json!({
                "professional_id": app.professional_id,
                "start_time": "2024-06-03T07:00:00Z",
                "estimated_duration_minutes": 30,
                "appointment_type": "general_consult"
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_bookable"], false);
    assert_eq!(body["has_conflict"], false);
    assert_eq!(body["availability"]["allowed"], false);
}

#[tokio::test]
async fn unknown_appointment_is_not_found() {
    let app = test_app().await;
    let admin = TestUser::admin("admin@clinic.test");

    let (status, body) = app.send(&admin, "GET", "/999", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn non_numeric_appointment_id_uses_error_envelope() {
    let app = test_app().await;
    let admin = TestUser::admin("admin@clinic.test");

    let (status, body) = app.send(&admin, "GET", "/not-a-number", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn malformed_body_uses_error_envelope() {
    let app = test_app().await;
    let receptionist = TestUser::receptionist("front@clinic.test");

    let (status, body) = app
        .send(&receptionist, "POST", "/", Some(json!({ "patient_id": "nobody" })))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn assistant_cannot_book_over_http() {
    let app = test_app().await;
    let assistant = TestUser::assistant("chairside@clinic.test");

    let (status, body) = app
        .send(&assistant, "POST", "/", Some(app.booking("2024-06-03T09:00:00Z")))
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}
