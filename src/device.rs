//! Public device facade: owns the session, correlator, datapoint
//! collection, and reassembly state for one BLE device.
//!
//! One struct holds the locked session/datapoint/reassembly state plus a
//! handful of atomics, fed by a background task that drains notifications
//! off a channel rather than polling a socket directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::codec::{self, DecodedMessage};
use crate::correlator::Correlator;
use crate::datapoint::{DataPoint, DataPointCollection, DataPointUpdate, DataPointValue};
use crate::dispatcher::{self, LocalTimeFields};
use crate::error::Error;
use crate::fragment::{self, Reassembler, GATT_MTU};
use crate::opcode;
use crate::session::{self, Session};
use crate::transport::{Credentials, CredentialsStore, Transport};

type DatapointCallback = Box<dyn Fn(&[DataPoint]) + Send + Sync>;
type ConnectedCallback = Box<dyn Fn() + Send + Sync>;
type DisconnectedCallback = Box<dyn Fn() + Send + Sync>;

struct CallbackList<F> {
    next_id: u64,
    entries: Vec<(u64, F)>,
}

impl<F> CallbackList<F> {
    fn new() -> Self {
        CallbackList {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, f: F) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, f));
        id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Returns a closure that unregisters callback `id` from `list`; calling it
/// more than once is a no-op.
fn unregister_fn<F: Send + 'static>(list: Arc<StdMutex<CallbackList<F>>>, id: u64) -> impl Fn() + Send + Sync {
    move || {
        list.lock().unwrap().remove(id);
    }
}

/// Owns one device's session, correlator, datapoints, and connection
/// lifecycle. Construct behind an `Arc` since `connect()` spawns a
/// background task that holds a clone of it.
pub struct Device<T: Transport> {
    transport: Arc<T>,
    credentials: Credentials,
    advertisement_uuid: Option<String>,
    session: AsyncMutex<Session>,
    correlator: Correlator,
    datapoints: AsyncMutex<DataPointCollection>,
    reassembler: AsyncMutex<Reassembler>,
    connect_lock: AsyncMutex<()>,
    operation_lock: AsyncMutex<()>,
    expected_disconnect: AtomicBool,
    rssi: AtomicI16,
    connected_callbacks: Arc<StdMutex<CallbackList<ConnectedCallback>>>,
    disconnected_callbacks: Arc<StdMutex<CallbackList<DisconnectedCallback>>>,
    datapoint_callbacks: Arc<StdMutex<CallbackList<DatapointCallback>>>,
}

impl<T: Transport + 'static> Device<T> {
    /// The credentials store lookup happens in `initialize`, not here, so
    /// construction never fails.
    pub fn new(transport: Arc<T>, credentials: Credentials, advertisement_uuid: Option<String>) -> Arc<Self> {
        Arc::new(Device {
            session: AsyncMutex::new(Session::new(&credentials.local_key)),
            transport,
            advertisement_uuid,
            credentials,
            correlator: Correlator::new(),
            datapoints: AsyncMutex::new(DataPointCollection::new()),
            reassembler: AsyncMutex::new(Reassembler::new()),
            connect_lock: AsyncMutex::new(()),
            operation_lock: AsyncMutex::new(()),
            expected_disconnect: AtomicBool::new(false),
            rssi: AtomicI16::new(0),
            connected_callbacks: Arc::new(StdMutex::new(CallbackList::new())),
            disconnected_callbacks: Arc::new(StdMutex::new(CallbackList::new())),
            datapoint_callbacks: Arc::new(StdMutex::new(CallbackList::new())),
        })
    }

    /// Loads credentials for `address` from `store` and builds a `Device`
    /// around them, decoding advertisement data if supplied.
    pub async fn initialize(
        transport: Arc<T>,
        store: &dyn CredentialsStore,
        address: &str,
        advertisement: Option<crate::advertisement::AdvertisementInfo>,
    ) -> Result<Arc<Self>, Error> {
        let credentials = store
            .get(address)
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?
            .ok_or(Error::Length("no credentials stored for this address"))?;
        let uuid = advertisement.and_then(|info| info.uuid);
        Ok(Self::new(transport, credentials, uuid))
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    pub fn name(&self) -> Option<&str> {
        self.credentials.device_name.as_deref()
    }

    pub fn rssi(&self) -> Option<i16> {
        self.transport.rssi().or_else(|| {
            let cached = self.rssi.load(Ordering::Relaxed);
            if cached == 0 { None } else { Some(cached) }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn is_paired(&self) -> bool {
        self.session.lock().await.is_paired()
    }

    pub async fn device_version(&self) -> Option<u16> {
        self.session.lock().await.device_info.as_ref().map(|i| i.firmware_version)
    }

    pub async fn hardware_version(&self) -> Option<u16> {
        self.session.lock().await.device_info.as_ref().map(|i| i.hardware_version)
    }

    pub async fn protocol_version(&self) -> Option<u16> {
        self.session.lock().await.device_info.as_ref().map(|i| i.protocol_version)
    }

    /// Register a callback for datapoint updates; returns an idempotent
    /// unregister function.
    pub fn register_datapoint_callback(&self, callback: impl Fn(&[DataPoint]) + Send + Sync + 'static) -> impl Fn() + Send + Sync {
        let id = self.datapoint_callbacks.lock().unwrap().push(Box::new(callback));
        unregister_fn(self.datapoint_callbacks.clone(), id)
    }

    pub fn register_connected_callback(&self, callback: impl Fn() + Send + Sync + 'static) -> impl Fn() + Send + Sync {
        let id = self.connected_callbacks.lock().unwrap().push(Box::new(callback));
        unregister_fn(self.connected_callbacks.clone(), id)
    }

    pub fn register_disconnected_callback(&self, callback: impl Fn() + Send + Sync + 'static) -> impl Fn() + Send + Sync {
        let id = self.disconnected_callbacks.lock().unwrap().push(Box::new(callback));
        unregister_fn(self.disconnected_callbacks.clone(), id)
    }

    /// Idle -> ... -> Operational. Idempotent while already
    /// paired; concurrent callers serialize on the connect lock.
    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let _connect_guard = self.connect_lock.lock().await;

        if self.session.lock().await.is_paired() {
            return Ok(());
        }

        self.expected_disconnect.store(false, Ordering::SeqCst);
        self.session.lock().await.begin_connecting();

        self.transport
            .open_connection()
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;

        let (tx, rx) = mpsc::channel(32);
        self.transport
            .subscribe(tx)
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;

        let notification_device = Arc::clone(self);
        tokio::spawn(async move {
            notification_device.run_notification_loop(rx).await;
        });

        self.session.lock().await.begin_awaiting_device_info();
        self.correlator.reset_seq_num();

        let device_info_reply = self.send_request_awaited(opcode::DEVICE_INFO, Vec::new()).await?;
        self.session.lock().await.on_device_info_reply(&device_info_reply)?;

        let pair_body = {
            let session = self.session.lock().await;
            session::build_pair_request(
                &self.credentials.uuid,
                &session.local_key_prefix(),
                &self.credentials.device_id,
            )
        };
        let pair_reply = self.send_request_awaited(opcode::PAIR, pair_body).await?;
        let result_byte = *pair_reply.first().unwrap_or(&0);
        self.session.lock().await.on_pair_reply(result_byte)?;

        self.fire_connected_callbacks();
        Ok(())
    }

    /// Cooperative disconnect: cancels no in-flight sends, but subsequent
    /// writes fail and pending awaiters time out.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.expected_disconnect.store(true, Ordering::SeqCst);
        let _ = self.transport.close_connection().await;
        self.handle_disconnect().await;
        Ok(())
    }

    async fn handle_disconnect(&self) {
        self.reassembler.lock().await.reset();
        self.session.lock().await.reset();
        self.correlator.cancel_all().await;
        self.fire_disconnected_callbacks();
    }

    /// Requests a status push from the device.
    pub async fn update(&self) -> Result<(), Error> {
        let reply = self.send_request_awaited(opcode::DEVICE_STATUS, Vec::new()).await?;
        if let Some(&result_byte) = reply.first() {
            if result_byte != 0 {
                return Err(Error::Device(result_byte));
            }
        }
        Ok(())
    }

    pub async fn datapoint(&self, id: u8) -> Option<DataPoint> {
        self.datapoints.lock().await.get(id).cloned()
    }

    pub async fn has_datapoint(&self, id: u8) -> bool {
        self.datapoints.lock().await.has(id)
    }

    pub async fn get_or_create_datapoint(&self, id: u8, initial: DataPointValue) -> DataPoint {
        self.datapoints.lock().await.get_or_create(id, initial).clone()
    }

    pub async fn begin_batch(&self) {
        self.datapoints.lock().await.begin_batch();
    }

    /// Flushes the outermost batch's dirty ids as one `SENDER_DPS` message.
    pub async fn end_batch(&self) -> Result<(), Error> {
        let (flushed, body) = {
            let mut datapoints = self.datapoints.lock().await;
            let flushed = datapoints.end_batch();
            let body = build_sender_dps_body(&datapoints, &flushed);
            (flushed, body)
        };
        if !flushed.is_empty() {
            self.send_request(opcode::SENDER_DPS, body).await?;
        }
        Ok(())
    }

    /// Coerces `value` to datapoint `id`'s declared type and sends or
    /// enqueues it.
    pub async fn set_value(&self, id: u8, value: DataPointValue) -> Result<(), Error> {
        let to_send = {
            let mut datapoints = self.datapoints.lock().await;
            let dp = datapoints.get_or_create(id, value.clone());
            dp.set_by_user(value)?;
            let ids = datapoints.mark_dirty(id);
            if ids.is_empty() {
                None
            } else {
                Some(build_sender_dps_body(&datapoints, &ids))
            }
        };
        if let Some(body) = to_send {
            self.send_request(opcode::SENDER_DPS, body).await?;
        }
        Ok(())
    }

    /// Build, fragment, and write one logical message; does not wait for a
    /// reply.
    async fn send_request(&self, op: u16, body: Vec<u8>) -> Result<(), Error> {
        let seq_num = self.correlator.next_seq_num();
        let fragments = self.encode_and_fragment(seq_num, 0, op, &body).await?;
        self.write_fragments(&fragments).await
    }

    /// Send an ack/auto-reply referencing an inbound message's `seq_num` as
    /// its `response_to`; does not wait for a reply.
    async fn send_message(&self, op: u16, response_to: u32, body: Vec<u8>) -> Result<(), Error> {
        let seq_num = self.correlator.next_seq_num();
        let fragments = self.encode_and_fragment(seq_num, response_to, op, &body).await?;
        self.write_fragments(&fragments).await
    }

    /// Build, fragment, write, and await the correlated reply's body.
    /// Interpreting the result byte is opcode-specific (e.g. `PAIR` treats
    /// both 0 and 2 as success), so the raw body is handed back to the
    /// caller rather than judged generically here.
    async fn send_request_awaited(&self, op: u16, body: Vec<u8>) -> Result<Vec<u8>, Error> {
        let seq_num = self.correlator.next_seq_num();
        let fragments = self.encode_and_fragment(seq_num, 0, op, &body).await?;
        let rx = self.correlator.register(seq_num).await;
        self.write_fragments(&fragments).await?;
        let reply = self.correlator.wait(seq_num, rx).await?;
        Ok(reply.body)
    }

    /// Encrypts and frames a message body into MTU-sized fragments.
    async fn encode_and_fragment(
        &self,
        seq_num: u32,
        response_to: u32,
        op: u16,
        body: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error> {
        let flag = codec::security_flag_for_opcode(op);
        let key = self
            .session
            .lock()
            .await
            .key_for_flag(flag)
            .ok_or(Error::Length("required key not yet established"))?;

        let encoded = codec::encode(seq_num, response_to, op, body, flag, &key);
        let protocol_version = self
            .session
            .lock()
            .await
            .device_info
            .as_ref()
            .map(|i| i.protocol_version as u8)
            .unwrap_or(0);
        Ok(fragment::split(&encoded, GATT_MTU, protocol_version))
    }

    async fn write_fragments(&self, fragments: &[Vec<u8>]) -> Result<(), Error> {
        let _op_guard = self.operation_lock.lock().await;
        for frag in fragments {
            self.transport
                .write(frag)
                .await
                .map_err(|e| Error::Transport(Box::new(e)))?;
        }
        Ok(())
    }

    async fn run_notification_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(fragment) = rx.recv().await {
            let complete = {
                let mut reassembler = self.reassembler.lock().await;
                match reassembler.feed(&fragment) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(error = %e, "fragment reassembly failed, resetting");
                        reassembler.reset();
                        continue;
                    }
                }
            };
            let Some(buffer) = complete else { continue };

            let decoded = {
                let session = self.session.lock().await;
                codec::decode(&buffer, |flag| session.key_for_flag(flag))
            };

            match decoded {
                Ok(message) => self.handle_decoded_message(message).await,
                Err(e) => tracing::warn!(error = %e, "dropping undecodable message"),
            }
        }

        if !self.expected_disconnect.load(Ordering::SeqCst) {
            self.handle_disconnect().await;
        }
    }

    async fn handle_decoded_message(&self, message: DecodedMessage) {
        if !opcode::is_device_originated(message.opcode) {
            self.correlator.dispatch(message).await;
            return;
        }

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let utc_offset_seconds = 0; // local timezone is a caller/platform concern; default UTC.
        let local_time = local_time_fields(now_ms / 1000, utc_offset_seconds);

        let outcome = match dispatcher::handle_unsolicited(message.opcode, &message.body, now_ms, utc_offset_seconds, local_time) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(opcode = message.opcode, error = %e, "dropping malformed unsolicited message");
                return;
            }
        };

        if !outcome.datapoints.is_empty() {
            let updated = self.apply_datapoint_updates(outcome.datapoints, now_ms / 1000).await;
            self.fire_datapoint_callbacks(&updated);
        }

        if let Some((ack_opcode, ack_body)) = outcome.ack {
            if let Err(e) = self.send_message(ack_opcode, message.seq_num, ack_body).await {
                tracing::warn!(error = %e, "failed to send auto-ack");
            }
        }
    }

    async fn apply_datapoint_updates(&self, updates: Vec<DataPointUpdate>, timestamp: u32) -> Vec<DataPoint> {
        let mut datapoints = self.datapoints.lock().await;
        let mut touched_ids = HashSet::new();
        for update in &updates {
            touched_ids.insert(update.id);
        }
        datapoints.apply_device_updates(updates, timestamp, 0);
        touched_ids
            .into_iter()
            .filter_map(|id| datapoints.get(id).map(|dp| dp.clone()))
            .collect()
    }

    fn fire_connected_callbacks(&self) {
        for (_, cb) in self.connected_callbacks.lock().unwrap().entries.iter() {
            cb();
        }
    }

    fn fire_disconnected_callbacks(&self) {
        for (_, cb) in self.disconnected_callbacks.lock().unwrap().entries.iter() {
            cb();
        }
    }

    fn fire_datapoint_callbacks(&self, updated: &[DataPoint]) {
        if updated.is_empty() {
            return;
        }
        for (_, cb) in self.datapoint_callbacks.lock().unwrap().entries.iter() {
            cb(updated);
        }
    }
}

fn build_sender_dps_body(datapoints: &DataPointCollection, ids: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for &id in ids {
        if let Some(dp) = datapoints.get(id) {
            let update = DataPointUpdate { id, value: dp.value.clone() };
            body.extend(crate::datapoint::serialize_update(&update));
        }
    }
    body
}

/// Converts a UTC+offset wall clock to `(yy, mm, dd, HH, MM, SS, wday)`
/// fields without a calendar-crate dependency, using the civil-calendar
/// algorithm from Howard Hinnant's `chrono`-compatible date conversions.
fn local_time_fields(utc_seconds: u64, utc_offset_seconds: i32) -> LocalTimeFields {
    let local_seconds = utc_seconds as i64 + utc_offset_seconds as i64;
    let days = local_seconds.div_euclid(86_400);
    let secs_of_day = local_seconds.rem_euclid(86_400);

    let (year, month, day) = civil_from_days(days);
    let hour = (secs_of_day / 3600) as u8;
    let minute = ((secs_of_day % 3600) / 60) as u8;
    let second = (secs_of_day % 60) as u8;
    // Jan 1 1970 was a Thursday (4); Python's tm_wday has Monday = 0.
    let weekday = (((days % 7) + 7 + 3) % 7) as u8;

    LocalTimeFields {
        year_in_century: (year % 100) as u8,
        month,
        day,
        hour,
        minute,
        second,
        weekday,
    }
}

fn civil_from_days(z: i64) -> (i64, u8, u8) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    let year = if m <= 2 { y + 1 } else { y };
    (year, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_from_days_matches_known_epoch_date() {
        // Days between 1970-01-01 and 2026-07-28.
        let (y, m, d) = civil_from_days(20_662);
        assert_eq!((y, m, d), (2026, 7, 28));
    }

    #[test]
    fn local_time_fields_weekday_matches_known_tuesday() {
        // 2026-07-28 is a Tuesday; Python's tm_wday has Monday = 0 so Tuesday = 1.
        let fields = local_time_fields(20_662 * 86_400, 0);
        assert_eq!(fields.weekday, 1);
        assert_eq!(fields.year_in_century, 26);
        assert_eq!(fields.month, 7);
        assert_eq!(fields.day, 28);
    }
}
