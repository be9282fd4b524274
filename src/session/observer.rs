//! Observer contract
//!
//! One callback per event kind. Every method has an empty default so an
//! observer only overrides what it cares about. Callbacks run on the
//! session task; keep them short.

use crate::domain::models::{
    BondState, CharacteristicId, ConnectionParameters, ConnectionPriority, ConnectionState,
    Descriptor, PeripheralId, PhyPair,
};
use crate::domain::status::GattStatus;

#[allow(unused_variables)]
pub trait SessionObserver: Send + Sync {
    /// `status` explains how the state was reached (e.g. `Timeout` for a
    /// connect attempt that expired).
    fn on_connection_state_changed(
        &self,
        peripheral: &PeripheralId,
        state: ConnectionState,
        status: GattStatus,
    ) {
    }

    fn on_bond_state_changed(&self, peripheral: &PeripheralId, state: BondState) {}

    fn on_bonding_started(&self, peripheral: &PeripheralId) {}

    fn on_bonding_succeeded(&self, peripheral: &PeripheralId) {}

    fn on_bonding_failed(&self, peripheral: &PeripheralId) {}

    fn on_bond_lost(&self, peripheral: &PeripheralId) {}

    fn on_characteristic_read(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        value: &[u8],
        status: GattStatus,
    ) {
    }

    fn on_characteristic_write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        value: &[u8],
        status: GattStatus,
    ) {
    }

    fn on_descriptor_read(
        &self,
        peripheral: &PeripheralId,
        descriptor: &Descriptor,
        value: &[u8],
        status: GattStatus,
    ) {
    }

    fn on_descriptor_write(
        &self,
        peripheral: &PeripheralId,
        descriptor: &Descriptor,
        value: &[u8],
        status: GattStatus,
    ) {
    }

    fn on_notification_state_changed(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        enabled: bool,
        status: GattStatus,
    ) {
    }

    /// Unsolicited value push (notification or indication).
    fn on_characteristic_update(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        value: &[u8],
    ) {
    }

    fn on_mtu_changed(&self, peripheral: &PeripheralId, mtu: u16, status: GattStatus) {}

    fn on_rssi_read(&self, peripheral: &PeripheralId, rssi: i16, status: GattStatus) {}

    fn on_connection_priority_requested(
        &self,
        peripheral: &PeripheralId,
        priority: ConnectionPriority,
        status: GattStatus,
    ) {
    }

    fn on_phy_updated(&self, peripheral: &PeripheralId, phy: Option<PhyPair>, status: GattStatus) {}

    fn on_connection_parameters_updated(
        &self,
        peripheral: &PeripheralId,
        parameters: &ConnectionParameters,
    ) {
    }
}
