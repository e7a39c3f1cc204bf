mod common;

use std::sync::{Arc, Mutex};

use common::{
    complete, i2c, make_controller, mock_adapter, tagged, Event,
    TestController,
};
use spb::{
    BusType, Configuration, ControllerInformation, DeviceServices,
    DeviceToken, InterfaceDescriptor, ResourceType, SpbError,
    SpiConfiguration, Transfer, TransferSet, HEADER_SIZE,
    SPB_CONTROLLER_INFORMATION_MAX_VERSION,
    SPB_CONTROLLER_INFORMATION_VERSION, SPB_INTERFACE_UUID,
};

// ---------------------------------------------------------------------------
// Mock device services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    CreateArbiter(DeviceToken, ResourceType),
    Publish(InterfaceDescriptor),
    Retract(InterfaceDescriptor),
}

struct MockServices {
    calls: Mutex<Vec<Call>>,
    arbiter_result: Result<(), SpbError>,
}

impl MockServices {
    fn new(arbiter_result: Result<(), SpbError>) -> Self {
        Self { calls: Mutex::new(Vec::new()), arbiter_result }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl DeviceServices for MockServices {
    fn create_resource_arbiter(
        &self,
        device: DeviceToken,
        resource: ResourceType,
    ) -> Result<(), SpbError> {
        self.calls.lock().unwrap().push(Call::CreateArbiter(device, resource));
        self.arbiter_result
    }

    fn publish_interface(
        &self,
        interface: &InterfaceDescriptor,
    ) -> Result<(), SpbError> {
        self.calls.lock().unwrap().push(Call::Publish(*interface));
        Ok(())
    }

    fn retract_interface(&self, interface: &InterfaceDescriptor) {
        self.calls.lock().unwrap().push(Call::Retract(*interface));
    }
}

fn create(
    version: u32,
    bus_type: u32,
    device: Option<DeviceToken>,
) -> Result<TestController, SpbError> {
    let (adapter, _) = mock_adapter();
    TestController::new(ControllerInformation {
        version,
        bus_type,
        max_frequency: 100_000,
        device,
        adapter,
    })
}

fn spi() -> Configuration {
    Configuration::spi(SpiConfiguration {
        speed: 1_000_000,
        word_size: 8,
        device_select: 1,
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Controller lifecycle
// ---------------------------------------------------------------------------

#[test]
fn create_validates_registration() {
    let i2c_type: u32 = BusType::I2c.into();
    let device = Some(DeviceToken(3));

    let oldest = SPB_CONTROLLER_INFORMATION_VERSION;
    let newest = SPB_CONTROLLER_INFORMATION_MAX_VERSION;
    assert!(create(oldest, i2c_type, device).is_ok());
    assert!(create(newest, i2c_type, device).is_ok());

    for (version, bus_type, device) in [
        (0, i2c_type, device),
        (SPB_CONTROLLER_INFORMATION_MAX_VERSION + 1, i2c_type, device),
        (SPB_CONTROLLER_INFORMATION_VERSION, 0, device),
        (SPB_CONTROLLER_INFORMATION_VERSION, 42, device),
        (SPB_CONTROLLER_INFORMATION_VERSION, i2c_type, None),
    ] {
        assert!(matches!(
            create(version, bus_type, device),
            Err(SpbError::InvalidParameter)
        ));
    }
}

#[test]
fn start_publishes_interface_and_stop_retracts_it() {
    let (controller, _) = make_controller();
    let services = MockServices::new(Ok(()));

    controller.start(&services).unwrap();
    controller.stop(&services);

    let interface = InterfaceDescriptor {
        uuid: SPB_INTERFACE_UUID,
        device: DeviceToken(7),
        bus_type: BusType::I2c,
    };
    assert_eq!(
        services.calls(),
        vec![
            Call::CreateArbiter(DeviceToken(7), ResourceType::SimpleBus),
            Call::Publish(interface),
            Call::Retract(interface),
        ]
    );
}

#[test]
fn start_tolerates_existing_arbiter() {
    let (controller, _) = make_controller();
    let services = MockServices::new(Err(SpbError::AlreadyInitialized));

    assert_eq!(controller.start(&services), Ok(()));
    assert!(matches!(services.calls().last(), Some(Call::Publish(_))));
}

#[test]
fn start_propagates_arbiter_failure() {
    let (controller, _) = make_controller();
    let services = MockServices::new(Err(SpbError::InsufficientResources));

    assert_eq!(
        controller.start(&services),
        Err(SpbError::InsufficientResources)
    );
    assert_eq!(services.calls().len(), 1);
}

#[test]
#[should_panic(expected = "open handles")]
fn stop_with_open_handle_is_fatal() {
    let (controller, _) = make_controller();
    let services = MockServices::new(Ok(()));
    let _handle = controller.open(&i2c(0x50)).unwrap();
    controller.stop(&services);
}

// ---------------------------------------------------------------------------
// Handle management
// ---------------------------------------------------------------------------

#[test]
fn open_and_close_track_handles() {
    let (controller, _) = make_controller();

    let a = controller.open(&i2c(0x50)).unwrap();
    let b = controller.open(&i2c(0x51)).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(controller.handle_count(), 2);

    a.close();
    assert_eq!(controller.handle_count(), 1);
    drop(b);
    assert_eq!(controller.handle_count(), 0);
}

#[test]
fn open_rejects_mismatched_bus_type() {
    let (controller, _) = make_controller();

    assert!(matches!(controller.open(&spi()), Err(SpbError::InvalidParameter)));
    assert_eq!(controller.handle_count(), 0);
}

#[test]
fn open_copies_configuration() {
    let (controller, _) = make_controller();
    let mut configuration = i2c(0x50);
    let handle = controller.open(&configuration).unwrap();

    configuration.header.flags = spb::DataFlags::SLAVE;
    assert_eq!(*handle.configuration().unwrap(), i2c(0x50));
}

#[test]
fn set_configuration_rejects_overflowing_vendor_data() {
    let (controller, _) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();
    let before = handle.configuration().unwrap();

    let mut bad = i2c(0x51);
    bad.header.vendor_data_size = bad.header.size - HEADER_SIZE as u32 + 1;
    assert_eq!(handle.set_configuration(&bad), Err(SpbError::InvalidParameter));

    let after = handle.configuration().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
}

#[test]
fn set_configuration_rejects_short_header_and_wrong_bus() {
    let (controller, _) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();

    let mut short = i2c(0x51);
    short.header.size = (HEADER_SIZE - 4) as u32;
    assert_eq!(
        handle.set_configuration(&short),
        Err(SpbError::InvalidParameter)
    );
    assert_eq!(
        handle.set_configuration(&spi()),
        Err(SpbError::InvalidParameter)
    );
    assert_eq!(*handle.configuration().unwrap(), i2c(0x50));
}

#[test]
fn set_configuration_replaces_storage() {
    let (controller, _) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();
    let before = handle.configuration().unwrap();

    handle.set_configuration(&i2c(0x50)).unwrap();
    let after = handle.configuration().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(*before, *after);
}

// ---------------------------------------------------------------------------
// Configuration cache
// ---------------------------------------------------------------------------

#[futures_test::test]
async fn same_handle_does_not_reconfigure() {
    let (controller, recorder) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();

    handle.submit_transfer_set(TransferSet::default()).await.unwrap();
    handle.submit_transfer_set(TransferSet::default()).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![
            Event::Lock(Some(0x50)),
            Event::Configure(0x50),
            Event::Unlock,
            Event::Lock(Some(0x50)),
            Event::Unlock,
        ]
    );
}

#[futures_test::test]
async fn closing_configured_handle_forces_reconfigure() {
    let (controller, recorder) = make_controller();

    let first = controller.open(&i2c(0x50)).unwrap();
    first.submit_transfer_set(TransferSet::default()).await.unwrap();
    first.close();

    let second = controller.open(&i2c(0x50)).unwrap();
    recorder.clear();
    second.submit_transfer_set(TransferSet::default()).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![Event::Lock(Some(0x50)), Event::Configure(0x50), Event::Unlock]
    );
}

#[futures_test::test]
async fn set_configuration_invalidates_cache() {
    let (controller, recorder) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();
    handle.submit_transfer_set(TransferSet::default()).await.unwrap();

    handle.set_configuration(&i2c(0x50)).unwrap();
    recorder.clear();
    handle.submit_transfer_set(TransferSet::default()).await.unwrap();

    assert_eq!(
        recorder.events(),
        vec![Event::Lock(Some(0x50)), Event::Configure(0x50), Event::Unlock]
    );
}

// ---------------------------------------------------------------------------
// Submission errors
// ---------------------------------------------------------------------------

#[futures_test::test]
async fn unconfigured_handle_cannot_submit() {
    let (controller, recorder) = make_controller();
    let handle = controller.open_unconfigured().unwrap();

    let (error, set) = handle
        .submit_transfer_set(TransferSet::new(vec![tagged(1)]))
        .await
        .unwrap_err();
    assert_eq!(error, SpbError::NotConfigured);
    assert_eq!(set.len(), 1);
    assert!(recorder.events().is_empty());

    handle.set_configuration(&i2c(0x22)).unwrap();
    handle.submit_transfer_set(set).await.unwrap();
    assert!(complete(&controller, &recorder, Ok(())));
    assert_eq!(controller.pending_sets(), 0);
}

#[futures_test::test]
async fn malformed_transfer_is_rejected() {
    let (controller, recorder) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();

    let mut transfer = Transfer::read(4);
    transfer.offset = 2;
    let (error, _) = handle
        .submit_transfer_set(TransferSet::new(vec![transfer]))
        .await
        .unwrap_err();

    assert_eq!(error, SpbError::InvalidParameter);
    assert!(recorder.events().is_empty());
    assert_eq!(controller.pending_sets(), 0);
}

#[futures_test::test]
async fn configuration_only_transaction_completes_without_transfers() {
    let (controller, recorder) = make_controller();
    let handle = controller.open(&i2c(0x50)).unwrap();

    let set =
        handle.execute_transfer_set(TransferSet::default()).await.unwrap();
    assert_eq!(set.status(), Some(Ok(())));
    assert!(!recorder
        .events()
        .iter()
        .any(|event| matches!(event, Event::Submit(_))));
    assert_eq!(handle.bus_references(), 0);
}
