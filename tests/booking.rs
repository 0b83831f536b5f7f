mod common;

use serde_json::{Value, json};

use common::{Client, start_test_server};

fn slots_of(reply: &Value) -> Vec<String> {
    reply["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

/// Doctor D has a SCHEDULED appointment at 10:00 on 2025-07-20.
#[tokio::test]
async fn booking_day_over_the_wire() {
    let server = start_test_server().await;
    let mut staff = Client::login(server.addr, "staff-c1").await;

    let booked = staff
        .call(json!({
            "op": "create-appointment",
            "patientId": "p1",
            "doctorId": "dr-a",
            "date": "2025-07-20T10:00:00Z",
            "notes": "annual check"
        }))
        .await;
    assert_eq!(booked["type"], "reply");
    assert_eq!(booked["status"], 201);
    assert_eq!(booked["data"]["status"], "SCHEDULED");
    let id = booked["data"]["id"].as_str().unwrap().to_string();

    let slots = slots_of(&staff.call(json!({"op": "slots", "doctor": "dr-a", "date": "2025-07-20"})).await);
    assert!(!slots.contains(&"10:00".to_string()));
    assert!(slots.contains(&"10:30".to_string()));
    assert_eq!(slots.len(), 15);

    let conflict = staff
        .call(json!({"op": "create-appointment", "patientId": "p2", "doctorId": "dr-a", "date": "2025-07-20T10:15:00Z"}))
        .await;
    assert_eq!(conflict["type"], "error");
    assert_eq!(conflict["status"], 409);
    assert_eq!(conflict["error"], "Conflict");
    assert_eq!(
        conflict["message"],
        "doctor already has an appointment within the conflict window"
    );

    let bad = staff
        .call(json!({"op": "update-status", "id": id, "status": "COMPLETED"}))
        .await;
    assert_eq!(bad["status"], 400);
    assert_eq!(bad["error"], "InvalidTransition");
    assert_eq!(bad["message"], "invalid status transition from SCHEDULED to COMPLETED");

    let cancelled = staff
        .call(json!({"op": "update-status", "id": id, "status": "CANCELLED"}))
        .await;
    assert_eq!(cancelled["status"], 200);
    assert_eq!(cancelled["data"]["status"], "CANCELLED");

    let slots = slots_of(&staff.call(json!({"op": "slots", "doctor": "dr-a", "date": "2025-07-20"})).await);
    assert!(slots.contains(&"10:00".to_string()));
    assert_eq!(slots.len(), 16);
}

#[tokio::test]
async fn simultaneous_bookings_from_many_connections() {
    let server = start_test_server().await;
    let mut tasks = Vec::new();
    for i in 0..8 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = Client::login(addr, "staff-c1").await;
            client
                .call(json!({
                    "op": "create-appointment",
                    "patientId": format!("p{i}"),
                    "doctorId": "dr-busy",
                    "date": "2025-07-20T14:00:00Z"
                }))
                .await
        }));
    }
    let mut statuses = Vec::new();
    for task in tasks {
        statuses.push(task.await.unwrap()["status"].as_u64().unwrap());
    }
    statuses.sort();
    assert_eq!(statuses, vec![201, 409, 409, 409, 409, 409, 409, 409]);
    assert_eq!(server.store.appointment_count(), 1);
}

#[tokio::test]
async fn reschedule_over_the_wire() {
    let server = start_test_server().await;
    let mut doctor = Client::login(server.addr, "dr-a").await;

    let first = doctor
        .call(json!({"op": "create-appointment", "patientId": "p1", "date": "2025-07-20T09:00"}))
        .await;
    let second = doctor
        .call(json!({"op": "create-appointment", "patientId": "p2", "date": "2025-07-20T11:00"}))
        .await;
    let id = first["data"]["id"].as_str().unwrap().to_string();
    let confirm = doctor
        .call(json!({"op": "update-status", "id": id, "status": "CONFIRMED"}))
        .await;
    assert_eq!(confirm["data"]["status"], "CONFIRMED");

    let clash = doctor
        .call(json!({"op": "reschedule", "id": id, "date": "2025-07-20T11:30"}))
        .await;
    assert_eq!(clash["status"], 409);

    let moved = doctor
        .call(json!({"op": "reschedule", "id": id, "date": "2025-07-20T15:00"}))
        .await;
    assert_eq!(moved["status"], 200);
    assert_eq!(moved["data"]["status"], "SCHEDULED");

    let fetched = doctor.call(json!({"op": "get-appointment", "id": id})).await;
    assert_eq!(fetched["data"]["start"], moved["data"]["start"]);
    assert_ne!(second["data"]["id"], fetched["data"]["id"]);
}

#[tokio::test]
async fn other_clinic_cannot_change_appointment() {
    let server = start_test_server().await;
    let mut c1 = Client::login(server.addr, "staff-c1").await;
    let booked = c1
        .call(json!({"op": "create-appointment", "patientId": "p1", "doctorId": "dr-a", "date": "2025-07-20T12:00"}))
        .await;
    let id = booked["data"]["id"].as_str().unwrap().to_string();

    let mut c2 = Client::login(server.addr, "staff-c2").await;
    let denied = c2
        .call(json!({"op": "update-status", "id": id, "status": "CANCELLED"}))
        .await;
    assert_eq!(denied["status"], 403);
    assert_eq!(denied["error"], "Forbidden");

    let denied = c2.call(json!({"op": "get-appointment", "id": id})).await;
    assert_eq!(denied["status"], 403);

    let mut root = Client::login(server.addr, "root").await;
    let fetched = root.call(json!({"op": "get-appointment", "id": id})).await;
    assert_eq!(fetched["data"]["status"], "SCHEDULED");
}

#[tokio::test]
async fn malformed_requests_get_validation_errors() {
    let server = start_test_server().await;
    let mut client = Client::login(server.addr, "staff-c1").await;

    let reply = client
        .call(json!({"op": "slots", "doctor": "dr-a", "date": "July 20th"}))
        .await;
    assert_eq!(reply["status"], 400);
    assert_eq!(reply["error"], "ValidationError");

    let reply = client.call(json!({"op": "no-such-op"})).await;
    assert_eq!(reply["status"], 400);

    let reply = client
        .call(json!({"op": "create-appointment", "patientId": "", "date": "2025-07-20T10:00"}))
        .await;
    assert_eq!(reply["status"], 400);
    assert!(reply["message"].as_str().unwrap().starts_with("patientId"));

    // connection stays usable
    assert_eq!(client.call(json!({"op": "ping"})).await["type"], "pong");
}
