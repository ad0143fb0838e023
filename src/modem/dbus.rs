//! ModemManager over the system D-Bus.
//!
//! Method calls go through `Connection::call_method`; signals are read from
//! two match-rule streams (everything under the ModemManager object tree,
//! and `NameOwnerChanged` for the service name) and translated into
//! [`TransportEvent`]s.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, MessageStream};

use super::{
    parse_timestamp, CreateRequest, DeliveryState, DeviceInfo, DevicePath, ModemState,
    ModemTransport, PduKind, SmsEntry, SmsPath, SmsState, TransportError, TransportEvent,
};

const MM_SERVICE: &str = "org.freedesktop.ModemManager1";
const MM_PATH: &str = "/org/freedesktop/ModemManager1";
const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
const MODEM_IFACE: &str = "org.freedesktop.ModemManager1.Modem";
const MESSAGING_IFACE: &str = "org.freedesktop.ModemManager1.Modem.Messaging";
const SMS_IFACE: &str = "org.freedesktop.ModemManager1.Sms";
const SIM_IFACE: &str = "org.freedesktop.ModemManager1.Sim";

/// Property map returned by `GetAll`.
type Props = HashMap<String, OwnedValue>;

/// Reply of `GetManagedObjects`.
type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, Props>>;

/// [`ModemTransport`] backed by ModemManager on the system bus.
#[derive(Debug, Clone)]
pub struct ModemManagerTransport {
    conn: Connection,
}

impl ModemManagerTransport {
    /// Connect to the system bus.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bus`] if the bus is unreachable.
    pub async fn system() -> Result<Self, TransportError> {
        let conn = Connection::system().await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    async fn call<B>(
        &self,
        path: &str,
        iface: &str,
        method: &str,
        body: &B,
    ) -> Result<zbus::Message, TransportError>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        self.conn
            .call_method(Some(MM_SERVICE), path, Some(iface), method, body)
            .await
            .map_err(classify_error)
    }

    async fn properties(&self, path: &str, iface: &str) -> Result<Props, TransportError> {
        let reply = self.call(path, PROPERTIES, "GetAll", &(iface,)).await?;
        let props: Props = reply.body().deserialize()?;
        Ok(props)
    }

    /// Whether ModemManager currently owns its bus name.
    pub async fn service_present(&self) -> bool {
        let reply = self
            .conn
            .call_method(
                Some(DBUS_SERVICE),
                DBUS_PATH,
                Some(DBUS_SERVICE),
                "NameHasOwner",
                &(MM_SERVICE,),
            )
            .await;
        match reply {
            Ok(msg) => msg.body().deserialize::<bool>().unwrap_or(false),
            Err(e) => {
                debug!(error = %e, "NameHasOwner failed");
                false
            }
        }
    }

    async fn device_info(
        &self,
        path: &str,
        messaging: bool,
        modem_props: Option<&Props>,
    ) -> Result<DeviceInfo, TransportError> {
        let fetched;
        let props = match modem_props {
            Some(p) => p,
            None => {
                fetched = self.properties(path, MODEM_IFACE).await?;
                &fetched
            }
        };

        let state = prop_i32(props, "State").map_or(ModemState::Unknown, ModemState::from_raw);
        let own_numbers = prop_strings(props, "OwnNumbers");
        let imsi = match prop_path(props, "Sim") {
            Some(sim) if sim != "/" => match self.properties(&sim, SIM_IFACE).await {
                Ok(sim_props) => prop_string(&sim_props, "Imsi").filter(|s| !s.is_empty()),
                Err(e) => {
                    debug!(sim = %sim, error = %e, "could not read SIM properties");
                    None
                }
            },
            _ => None,
        };

        Ok(DeviceInfo {
            path: DevicePath(path.to_owned()),
            messaging,
            state,
            own_numbers,
            imsi,
        })
    }

    /// Spawn the signal watcher. Events are sent until the receiver is
    /// dropped or the bus connection closes.
    pub fn spawn_watcher(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.watch(events).await {
                warn!(error = %e, "modem signal watcher stopped");
            }
        })
    }

    async fn watch(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let mm_rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .path_namespace(MM_PATH)?
            .build();
        let owner_rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(DBUS_SERVICE)?
            .interface(DBUS_SERVICE)?
            .member("NameOwnerChanged")?
            .arg(0, MM_SERVICE)?
            .build();

        let mut mm_stream = MessageStream::for_match_rule(mm_rule, &self.conn, None).await?;
        let mut owner_stream = MessageStream::for_match_rule(owner_rule, &self.conn, None).await?;

        // Absence is a state: announce presence only if the service is there.
        if self.service_present().await && events.send(TransportEvent::ServiceAppeared).await.is_err() {
            return Ok(());
        }
        info!("watching ModemManager signals");

        loop {
            let event = tokio::select! {
                Some(msg) = owner_stream.next() => match msg {
                    Ok(msg) => owner_changed(&msg),
                    Err(e) => {
                        debug!(error = %e, "bad NameOwnerChanged message");
                        None
                    }
                },
                Some(msg) = mm_stream.next() => match msg {
                    Ok(msg) => self.translate(&msg).await,
                    Err(e) => {
                        debug!(error = %e, "bad ModemManager signal");
                        None
                    }
                },
                else => break,
            };
            if let Some(event) = event {
                trace!(?event, "transport event");
                if events.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        info!("ModemManager signal streams closed");
        Ok(())
    }

    async fn translate(&self, msg: &zbus::Message) -> Option<TransportEvent> {
        let (path, iface, member) = {
            let header = msg.header();
            (
                header.path()?.as_str().to_owned(),
                header.interface()?.as_str().to_owned(),
                header.member()?.as_str().to_owned(),
            )
        };
        let body = msg.body();

        match (iface.as_str(), member.as_str()) {
            (OBJECT_MANAGER, "InterfacesAdded") => {
                let (object, ifaces): (OwnedObjectPath, HashMap<String, Props>) =
                    body.deserialize().ok()?;
                if !ifaces.contains_key(MODEM_IFACE) && !ifaces.contains_key(MESSAGING_IFACE) {
                    return None;
                }
                let messaging = ifaces.contains_key(MESSAGING_IFACE);
                match self
                    .device_info(object.as_str(), messaging, ifaces.get(MODEM_IFACE))
                    .await
                {
                    Ok(info) => Some(TransportEvent::DeviceAdded(info)),
                    Err(e) => {
                        warn!(device = %object.as_str(), error = %e, "could not read added modem");
                        None
                    }
                }
            }
            (OBJECT_MANAGER, "InterfacesRemoved") => {
                let (object, ifaces): (OwnedObjectPath, Vec<String>) = body.deserialize().ok()?;
                let gone = ifaces
                    .iter()
                    .any(|i| i == MODEM_IFACE || i == MESSAGING_IFACE);
                gone.then(|| TransportEvent::DeviceRemoved(DevicePath(object.as_str().to_owned())))
            }
            (MESSAGING_IFACE, "Added") => {
                let (sms, received): (OwnedObjectPath, bool) = body.deserialize().ok()?;
                Some(TransportEvent::MessageAdded {
                    device: DevicePath(path),
                    sms: SmsPath(sms.as_str().to_owned()),
                    received,
                })
            }
            (PROPERTIES, "PropertiesChanged") => {
                let (changed_iface, changed, _invalidated): (String, Props, Vec<String>) =
                    body.deserialize().ok()?;
                match changed_iface.as_str() {
                    MODEM_IFACE => prop_i32(&changed, "State").map(|s| {
                        TransportEvent::ModemStateChanged {
                            device: DevicePath(path),
                            state: ModemState::from_raw(s),
                        }
                    }),
                    SMS_IFACE => prop_u32(&changed, "State").map(|s| TransportEvent::SmsStateChanged {
                        sms: SmsPath(path),
                        state: SmsState::from_raw(s),
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ModemTransport for ModemManagerTransport {
    async fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let reply = self
            .call(MM_PATH, OBJECT_MANAGER, "GetManagedObjects", &())
            .await?;
        let objects: ManagedObjects = reply.body().deserialize()?;

        let mut devices = Vec::new();
        for (path, ifaces) in &objects {
            let Some(modem) = ifaces.get(MODEM_IFACE) else {
                continue;
            };
            let messaging = ifaces.contains_key(MESSAGING_IFACE);
            devices.push(self.device_info(path.as_str(), messaging, Some(modem)).await?);
        }
        debug!(count = devices.len(), "enumerated modems");
        Ok(devices)
    }

    async fn list_messages(&self, device: &DevicePath) -> Result<Vec<SmsPath>, TransportError> {
        let reply = self.call(&device.0, MESSAGING_IFACE, "List", &()).await?;
        let paths: Vec<OwnedObjectPath> = reply.body().deserialize()?;
        Ok(paths
            .into_iter()
            .map(|p| SmsPath(p.as_str().to_owned()))
            .collect())
    }

    async fn read_message(&self, sms: &SmsPath) -> Result<SmsEntry, TransportError> {
        let props = self.properties(&sms.0, SMS_IFACE).await?;
        Ok(SmsEntry {
            path: sms.clone(),
            state: prop_u32(&props, "State").map_or(SmsState::Unknown, SmsState::from_raw),
            pdu: PduKind::from_raw(prop_u32(&props, "PduType").unwrap_or(0)),
            number: prop_string(&props, "Number").unwrap_or_default(),
            text: prop_string(&props, "Text").unwrap_or_default(),
            timestamp: prop_string(&props, "Timestamp").and_then(|t| parse_timestamp(&t)),
            discharge_timestamp: prop_string(&props, "DischargeTimestamp")
                .and_then(|t| parse_timestamp(&t)),
            delivery_state: prop_u32(&props, "DeliveryState")
                .map_or(DeliveryState::Unknown, DeliveryState::from_raw),
            message_reference: prop_u32(&props, "MessageReference").unwrap_or(0),
        })
    }

    async fn create_message(
        &self,
        device: &DevicePath,
        request: &CreateRequest,
    ) -> Result<SmsPath, TransportError> {
        let mut props: HashMap<&str, Value<'_>> = HashMap::new();
        props.insert("text", Value::from(request.text.as_str()));
        props.insert("number", Value::from(request.number.as_str()));
        props.insert("delivery-report-request", Value::from(request.delivery_report));
        props.insert("validity", Value::from(request.validity));

        let reply = self.call(&device.0, MESSAGING_IFACE, "Create", &(props,)).await?;
        let path: OwnedObjectPath = reply.body().deserialize()?;
        debug!(device = %device, sms = %path.as_str(), "created outbound message");
        Ok(SmsPath(path.as_str().to_owned()))
    }

    async fn send_message(&self, sms: &SmsPath) -> Result<(), TransportError> {
        self.call(&sms.0, SMS_IFACE, "Send", &()).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        device: &DevicePath,
        sms: &SmsPath,
    ) -> Result<(), TransportError> {
        let target = ObjectPath::try_from(sms.0.as_str())
            .map_err(|e| TransportError::Malformed(format!("bad sms path {}: {e}", sms)))?;
        self.call(&device.0, MESSAGING_IFACE, "Delete", &(target,))
            .await?;
        Ok(())
    }

    async fn message_reference(&self, sms: &SmsPath) -> Result<u32, TransportError> {
        let props = self.properties(&sms.0, SMS_IFACE).await?;
        Ok(prop_u32(&props, "MessageReference").unwrap_or(0))
    }
}

/// Translate a `NameOwnerChanged` signal for the ModemManager name.
fn owner_changed(msg: &zbus::Message) -> Option<TransportEvent> {
    let (name, _old, new): (String, String, String) = msg.body().deserialize().ok()?;
    if name != MM_SERVICE {
        return None;
    }
    if new.is_empty() {
        Some(TransportEvent::ServiceVanished)
    } else {
        Some(TransportEvent::ServiceAppeared)
    }
}

fn classify_error(e: zbus::Error) -> TransportError {
    if let zbus::Error::MethodError(name, detail, _) = &e {
        let detail = detail.clone().unwrap_or_default();
        return match name.as_str() {
            "org.freedesktop.DBus.Error.ServiceUnknown"
            | "org.freedesktop.DBus.Error.NameHasNoOwner" => TransportError::ServiceUnavailable,
            "org.freedesktop.DBus.Error.UnknownObject"
            | "org.freedesktop.DBus.Error.UnknownMethod" => TransportError::NoSuchObject(detail),
            other => TransportError::Rejected(format!("{other}: {detail}")),
        };
    }
    TransportError::Bus(e)
}

fn prop<'a>(props: &'a Props, key: &str) -> Option<&'a Value<'static>> {
    props.get(key).map(|v| &**v)
}

fn prop_u32(props: &Props, key: &str) -> Option<u32> {
    match prop(props, key)? {
        Value::U32(n) => Some(*n),
        _ => None,
    }
}

fn prop_i32(props: &Props, key: &str) -> Option<i32> {
    match prop(props, key)? {
        Value::I32(n) => Some(*n),
        _ => None,
    }
}

fn prop_string(props: &Props, key: &str) -> Option<String> {
    match prop(props, key)? {
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn prop_path(props: &Props, key: &str) -> Option<String> {
    match prop(props, key)? {
        Value::ObjectPath(p) => Some(p.as_str().to_owned()),
        _ => None,
    }
}

fn prop_strings(props: &Props, key: &str) -> Vec<String> {
    let Some(Value::Array(arr)) = prop(props, key) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|v| match v {
            Value::Str(s) => Some(s.to_string()),
            _ => None,
        })
        .collect()
}
