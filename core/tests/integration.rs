//! End-to-end scenarios driving a `Client` against an in-process
//! `ReplayServer` over a loopback transport: bus enumeration, property
//! get/set round trips, and fail-fast error handling.

use std::collections::BTreeMap;
use std::time::Duration;

use propcan::client::Client;
use propcan::manifest::{Manifest, Property};
use propcan::model::{ErrorCode, NodeId, PropertyIndex, PropertyType};
use propcan::Error;
use propcan_testfixture::{loopback_pair, ReplayServer};

const TIMEOUT: Duration = Duration::from_secs(2);

fn voltage_property() -> Property {
    Property {
        index: 1,
        name: "voltage".to_string(),
        r#type: PropertyType::Uint16,
        unit: "mV".to_string(),
        offset_str: "0".to_string(),
        scale_str: "1".to_string(),
        range_str: ("0".to_string(), "65535".to_string()),
        operations_str: "rw".to_string(),
        additional_attributes: BTreeMap::new(),
    }
}

fn widget_manifest() -> Manifest {
    Manifest::new("Widget".to_string(), vec![voltage_property()])
}

#[tokio::test]
async fn enumerate_nodes_finds_the_replaying_node() {
    let (client_end, mut server_end) = loopback_pair();
    let node_id = NodeId::new(3).unwrap();
    let mut server = ReplayServer::new(node_id, &widget_manifest()).unwrap();

    let server_task = tokio::spawn(async move {
        let _ = server.run(&mut server_end).await;
    });

    let mut client = Client::new(client_end);
    let nodes = client.enumerate_nodes(TIMEOUT).await.unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node_id, node_id);
    assert_eq!(nodes[0].manifest.device_name, "Widget");
    assert_eq!(nodes[0].manifest.properties.len(), 1);
    assert_eq!(nodes[0].manifest.properties[0].name, "voltage");

    server_task.abort();
}

#[tokio::test]
async fn set_then_get_property_round_trips() {
    let (client_end, mut server_end) = loopback_pair();
    let node_id = NodeId::new(5).unwrap();
    let manifest = widget_manifest();
    let mut server = ReplayServer::new(node_id, &manifest).unwrap();

    let server_task = tokio::spawn(async move {
        let _ = server.run(&mut server_end).await;
    });

    let property = voltage_property();
    let node = propcan::client::Node {
        node_id,
        manifest,
    };

    let mut client = Client::new(client_end);
    let written = client.set_property(&node, &property, 4200.0, TIMEOUT).await.unwrap();
    assert_eq!(written, 4200.0);

    let read = client.get_property(&node, &property, TIMEOUT).await.unwrap();
    assert_eq!(read, 4200.0);

    server_task.abort();
}

#[tokio::test]
async fn forced_error_response_fails_fast_instead_of_timing_out() {
    let (client_end, mut server_end) = loopback_pair();
    let node_id = NodeId::new(7).unwrap();
    let manifest = widget_manifest();
    let mut server = ReplayServer::new(node_id, &manifest).unwrap();
    server.force_error(propcan::model::Opcode::ReadProperty as u8, ErrorCode::InternalError);

    let server_task = tokio::spawn(async move {
        let _ = server.run(&mut server_end).await;
    });

    let property = voltage_property();
    let node = propcan::client::Node { node_id, manifest };

    let mut client = Client::new(client_end);
    let result = client.get_property(&node, &property, TIMEOUT).await;

    match result {
        Err(Error::DeviceError { error_code, .. }) => assert_eq!(error_code, ErrorCode::InternalError),
        Err(other) => panic!("expected a device error, got {other:?}"),
        Ok(value) => panic!("expected fail-fast, got a value: {value}"),
    }

    server_task.abort();
}

#[tokio::test]
async fn query_properties_batches_get_and_set_without_aborting_on_failure() {
    let (client_end, mut server_end) = loopback_pair();
    let node_id = NodeId::new(2).unwrap();
    let manifest = widget_manifest();
    let mut server = ReplayServer::new(node_id, &manifest).unwrap();

    let server_task = tokio::spawn(async move {
        let _ = server.run(&mut server_end).await;
    });

    let index = PropertyIndex::new(1).unwrap();
    let mut client = Client::new(client_end);
    let requests = vec![
        (node_id, propcan::client::PropertyRequest::Set(index, vec![0x10, 0x00])),
        (node_id, propcan::client::PropertyRequest::Get(index)),
    ];
    let results = client.query_properties(requests, TIMEOUT).await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0], Some(vec![0x10, 0x00]));
    assert_eq!(results[1], Some(vec![0x10, 0x00]));

    server_task.abort();
}
