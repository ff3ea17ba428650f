//! Wire-level tests: SCU against SCP over localhost TCP, no database.

mod common;

use common::{build_test_object, MockScp};
use dimse::{RemoteNode, StatusClass, StoreContext, StoreScu};

fn store_context(instance_uid: &str) -> StoreContext {
    StoreContext {
        sop_class_uid: common::dicom::test_sop_class().to_string(),
        sop_instance_uid: instance_uid.to_string(),
        transfer_syntax_uid: common::dicom::test_transfer_syntax().to_string(),
    }
}

#[tokio::test]
async fn echo_roundtrip() {
    let mock = MockScp::start("MOCK_SCP", vec![], None).await;
    let scu = StoreScu::new("TEST_SCU");
    let node = RemoteNode::new("MOCK_SCP", "127.0.0.1", mock.addr.port());

    scu.echo(&node).await.expect("echo");
    mock.stop().await;
}

#[tokio::test]
async fn store_preserves_bytes_exactly() {
    let mock = MockScp::start("MOCK_SCP", vec![], None).await;
    let scu = StoreScu::new("TEST_SCU");
    let node = RemoteNode::new("MOCK_SCP", "127.0.0.1", mock.addr.port());

    let object = build_test_object("1.2.3.9", "1.2.3.9.1", "1.2.3.9.1.1", "CT", 300_000);
    let context = store_context("1.2.3.9.1.1");

    let mut session = scu
        .open(&node, StoreScu::proposals_for(&context))
        .await
        .expect("open association");
    let reply = session
        .store(&context, &mut object.as_slice())
        .await
        .expect("store");
    assert_eq!(reply.class, StatusClass::Success);

    // A second object on the same association.
    let second = build_test_object("1.2.3.9", "1.2.3.9.1", "1.2.3.9.1.2", "CT", 1_000);
    let reply = session
        .store(&store_context("1.2.3.9.1.2"), &mut second.as_slice())
        .await
        .expect("second store");
    assert_eq!(reply.class, StatusClass::Success);

    session.release().await.expect("release");

    let received = mock.received_objects();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0], object, "first object must be byte-identical");
    assert_eq!(received[1], second, "second object must be byte-identical");
    mock.stop().await;
}

#[tokio::test]
async fn scripted_status_is_surfaced() {
    let mock = MockScp::start("MOCK_SCP", vec![0xA700, 0xC001], None).await;
    let scu = StoreScu::new("TEST_SCU");
    let node = RemoteNode::new("MOCK_SCP", "127.0.0.1", mock.addr.port());

    let object = build_test_object("1.2.4", "1.2.4.1", "1.2.4.1.1", "MR", 500);
    let context = store_context("1.2.4.1.1");

    let mut session = scu
        .open(&node, StoreScu::proposals_for(&context))
        .await
        .expect("open");

    let reply = session
        .store(&context, &mut object.as_slice())
        .await
        .expect("store exchange");
    assert_eq!(reply.status, 0xA700);
    assert_eq!(reply.class, StatusClass::RefusedOutOfResources);

    let reply = session
        .store(&context, &mut object.as_slice())
        .await
        .expect("store exchange");
    assert_eq!(reply.status, 0xC001);
    assert_eq!(reply.class, StatusClass::Failure);

    // Third is past the script and succeeds.
    let reply = session
        .store(&context, &mut object.as_slice())
        .await
        .expect("store exchange");
    assert_eq!(reply.class, StatusClass::Success);

    session.release().await.expect("release");
    assert_eq!(mock.received_objects().len(), 1);
    mock.stop().await;
}

#[tokio::test]
async fn unsupported_sop_class_leaves_context_unaccepted() {
    // The mock accepts only MR storage; CT proposals are refused while
    // verification still negotiates.
    let mock = MockScp::start(
        "MOCK_SCP",
        vec![],
        Some(vec!["1.2.840.10008.5.1.4.1.1.4".to_string()]),
    )
    .await;
    let scu = StoreScu::new("TEST_SCU");
    let node = RemoteNode::new("MOCK_SCP", "127.0.0.1", mock.addr.port());

    let context = store_context("1.2.5.1.1");
    let session = scu
        .open(&node, StoreScu::proposals_for(&context))
        .await
        .expect("association establishes on the verification context");
    assert!(!session.supports(&context));
    session.release().await.expect("release");
    mock.stop().await;
}

#[tokio::test]
async fn wrong_called_aet_is_rejected() {
    let mock = MockScp::start("MOCK_SCP", vec![], None).await;
    let scu = StoreScu::new("TEST_SCU");
    let node = RemoteNode::new("SOMEONE_ELSE", "127.0.0.1", mock.addr.port());

    let result = scu.echo(&node).await;
    assert!(matches!(
        result,
        Err(dimse::DimseError::AssociationRejected { reason: 7, .. })
    ));
    mock.stop().await;
}
