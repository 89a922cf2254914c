/// Legacy interface type reported in the bus information descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Internal,
    Isa,
    PciBus,
    PnpBus,
}

/// Descriptor returned (as a copy) by a query-bus-information request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpBusInformation {
    pub bus_type_guid: u128,
    pub legacy_bus_type: InterfaceType,
    pub bus_number: u32,
}

/// GUID identifying the virtual disk bus type, {2530ea73-086b-11d1-a09f-00c04fc340b1}.
pub const BUS_TYPE_GUID: u128 = 0x2530ea73_086b_11d1_a09f_00c04fc340b1;

impl Default for PnpBusInformation {
    fn default() -> Self {
        Self {
            bus_type_guid: BUS_TYPE_GUID,
            legacy_bus_type: InterfaceType::PnpBus,
            bus_number: 0,
        }
    }
}

/// Static configuration of a bus instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Product name; the device text is `"<product> Bus"`.
    pub product: String,
    pub bus_information: PnpBusInformation,
    /// Name of the lifecycle worker thread.
    pub worker_name: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            product: "VBlk".to_string(),
            bus_information: PnpBusInformation::default(),
            worker_name: "vblk-bus".to_string(),
        }
    }
}

impl BusConfig {
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn device_text(&self) -> String {
        format!("{} Bus", self.product)
    }
}
