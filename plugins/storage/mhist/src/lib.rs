pub mod proto;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tonic::codec::Streaming;

use relay_api::{
    Filter, Measurement, MeasurementSubscription, MeasurementWriter, RelayError, RelayFuture,
    StoreClient, StoreRecord,
};

use proto::{MeasurementMessage, MhistClient, measurement};

/// Буфер между MeasurementWriter::send и client-streaming вызовом.
const WRITE_BUFFER: usize = 256;

// ═══════════════════════════════════════════════════════════════
//  Conversions
// ═══════════════════════════════════════════════════════════════

impl From<MeasurementMessage> for StoreRecord {
    fn from(msg: MeasurementMessage) -> Self {
        let measurement = match msg.measurement.and_then(|m| m.r#type) {
            Some(measurement::Type::Numerical(n)) => Measurement::Numerical { ts: n.ts, value: n.value },
            Some(measurement::Type::Categorical(c)) => Measurement::Categorical { ts: c.ts, value: c.value },
            Some(measurement::Type::Raw(r)) => Measurement::Raw { ts: r.ts, value: r.value },
            // пустое измерение: нулевой Raw
            None => Measurement::Raw { ts: 0, value: Vec::new() },
        };
        StoreRecord {
            name: msg.name,
            measurement,
        }
    }
}

impl From<StoreRecord> for MeasurementMessage {
    fn from(record: StoreRecord) -> Self {
        let kind = match record.measurement {
            Measurement::Numerical { ts, value } => measurement::Type::Numerical(proto::Numerical { ts, value }),
            Measurement::Categorical { ts, value } => measurement::Type::Categorical(proto::Categorical { ts, value }),
            Measurement::Raw { ts, value } => measurement::Type::Raw(proto::Raw { ts, value }),
        };
        MeasurementMessage {
            name: record.name,
            measurement: Some(proto::Measurement { r#type: Some(kind) }),
        }
    }
}

/// `localhost:6666` → `http://localhost:6666`; полный URI не меняется.
pub fn endpoint_uri(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription / Writer
// ═══════════════════════════════════════════════════════════════

type Handshake = JoinHandle<Result<Streaming<MeasurementMessage>, Status>>;

enum SubscriptionState {
    /// Заголовки ответа ещё не пришли: grpc-go отправляет их вместе с первым сообщением.
    Pending(Handshake),
    Open(Streaming<MeasurementMessage>),
    Closed,
}

pub struct MhistSubscription {
    state: SubscriptionState,
}

impl MhistSubscription {
    async fn stream(&mut self) -> Result<&mut Streaming<MeasurementMessage>, RelayError> {
        if let SubscriptionState::Pending(handshake) = &mut self.state {
            let opened = handshake.await;
            self.state = SubscriptionState::Closed;
            let stream = match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(status)) => return Err(status_error(&status)),
                Err(e) => return Err(RelayError::StreamReceive(format!("subscribe task: {e}"))),
            };
            self.state = SubscriptionState::Open(stream);
        }
        match &mut self.state {
            SubscriptionState::Open(stream) => Ok(stream),
            _ => Err(RelayError::StreamReceive("subscription is closed".into())),
        }
    }
}

impl MeasurementSubscription for MhistSubscription {
    fn recv(&mut self) -> RelayFuture<'_, Option<StoreRecord>> {
        Box::pin(async move {
            let stream = self.stream().await?;
            match stream.message().await {
                Ok(msg) => Ok(msg.map(StoreRecord::from)),
                Err(status) => Err(status_error(&status)),
            }
        })
    }
}

impl Drop for MhistSubscription {
    fn drop(&mut self) {
        if let SubscriptionState::Pending(handshake) = &self.state {
            handshake.abort();
        }
    }
}

fn status_error(status: &Status) -> RelayError {
    RelayError::StreamReceive(format!("{}: {}", status.code(), status.message()))
}

/// Client-streaming вызов StoreStream живёт в отдельной задаче;
/// writer кладёт сообщения в её канал. Задача завершилась = вызов завершён.
pub struct MhistWriter {
    tx: mpsc::Sender<MeasurementMessage>,
    call: JoinHandle<()>,
}

impl MeasurementWriter for MhistWriter {
    fn send(&mut self, record: StoreRecord) -> RelayFuture<'_, ()> {
        Box::pin(async move {
            if self.call.is_finished() {
                return Err(RelayError::StreamSend("store stream is closed".into()));
            }
            self.tx
                .send(MeasurementMessage::from(record))
                .await
                .map_err(|_| RelayError::StreamSend("store stream is closed".into()))
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MhistStore
// ═══════════════════════════════════════════════════════════════

/// gRPC клиент store (mhist).
pub struct MhistStore {
    address: String,
    client: MhistClient,
}

impl MhistStore {
    pub async fn connect(address: &str) -> Result<Self, RelayError> {
        let uri = endpoint_uri(address);
        let client = MhistClient::connect(uri.clone())
            .await
            .map_err(|e| RelayError::connection(uri.clone(), e))?;
        tracing::info!(store = %uri, "connected to store");
        Ok(Self { address: uri, client })
    }
}

impl StoreClient for MhistStore {
    /// Возвращается сразу, не дожидаясь заголовков ответа: ошибка
    /// самого вызова придёт первым `recv` как `StreamReceive`.
    fn subscribe(&self, filter: &Filter) -> RelayFuture<'_, Box<dyn MeasurementSubscription>> {
        let request = proto::Filter {
            names: filter.names().map(str::to_string).collect(),
        };
        let mut client = self.client.clone();
        Box::pin(async move {
            let handshake = tokio::spawn(async move {
                client.subscribe(request).await.map(tonic::Response::into_inner)
            });
            tracing::debug!(store = %self.address, "subscription requested");
            Ok(Box::new(MhistSubscription {
                state: SubscriptionState::Pending(handshake),
            }) as Box<dyn MeasurementSubscription>)
        })
    }

    fn open_write_stream(&self) -> RelayFuture<'_, Box<dyn MeasurementWriter>> {
        let mut client = self.client.clone();
        let address = self.address.clone();
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(WRITE_BUFFER);
            let call = tokio::spawn(async move {
                match client.store_stream(ReceiverStream::new(rx)).await {
                    Ok(_) => tracing::info!(store = %address, "store write stream finished"),
                    Err(status) => tracing::error!(
                        store = %address,
                        code = %status.code(),
                        error = %status.message(),
                        "store write stream failed"
                    ),
                }
            });
            Ok(Box::new(MhistWriter { tx, call }) as Box<dyn MeasurementWriter>)
        })
    }
}
