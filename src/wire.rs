use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::auth::SharedSecret;
use crate::engine::{self, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::Event;
use crate::observability;
use crate::protocol::{self, ProtocolError, Request};

/// Serve one TCP connection, negotiating TLS first when configured.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    auth: SharedSecret,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor.accept(socket).await?;
            handle_session(stream, engine, auth).await
        }
        None => handle_session(socket, engine, auth).await,
    }
}

fn to_io<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::other(e.to_string())
}

fn ok_line(extra: Value) -> io::Result<String> {
    let mut value = extra;
    if let Value::Object(map) = &mut value {
        map.insert("ok".into(), json!(true));
    }
    serde_json::to_string(&value).map_err(to_io)
}

fn err_line(code: &str, message: &str) -> io::Result<String> {
    serde_json::to_string(&json!({
        "ok": false,
        "error": code,
        "message": message,
    }))
    .map_err(to_io)
}

fn engine_err_line(e: &EngineError) -> io::Result<String> {
    err_line(e.code(), &e.to_string())
}

/// One session: a hello handshake, then a request/reply loop. A session
/// holding a subscription also streams `{"event": ...}` lines between
/// replies.
async fn handle_session<S>(
    stream: S,
    engine: Arc<Engine>,
    auth: SharedSecret,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    // Handshake: the first frame must be a valid hello.
    let first = match framed.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(to_io(e)),
        None => return Ok(()),
    };
    match protocol::parse_request(&first) {
        Ok(Request::Hello { secret }) if auth.verify(&secret) => {
            framed
                .send(ok_line(json!({"server": "wayfare"}))?)
                .await
                .map_err(to_io)?;
        }
        _ => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            framed
                .send(err_line("unauthorized", "hello with a valid secret required")?)
                .await
                .map_err(to_io)?;
            return Ok(());
        }
    }

    let mut subscription: Option<(Ulid, broadcast::Receiver<Event>)> = None;

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let Some(line) = incoming else { break };
                let line = line.map_err(to_io)?;
                let reply = handle_line(&engine, &line, &mut subscription).await?;
                framed.send(reply).await.map_err(to_io)?;
            }
            // Only polled while a subscription is live.
            event = async {
                match &mut subscription {
                    Some((_, rx)) => rx.recv().await,
                    None => unreachable!("guarded by subscription.is_some()"),
                }
            }, if subscription.is_some() => {
                match event {
                    Ok(ev) => {
                        let line = serde_json::to_string(&json!({"event": ev})).map_err(to_io)?;
                        framed.send(line).await.map_err(to_io)?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let line = err_line(
                            "subscription_lagged",
                            &format!("{missed} events dropped"),
                        )?;
                        framed.send(line).await.map_err(to_io)?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription = None;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_line(
    engine: &Arc<Engine>,
    line: &str,
    subscription: &mut Option<(Ulid, broadcast::Receiver<Event>)>,
) -> io::Result<String> {
    let req = match protocol::parse_request(line) {
        Ok(req) => req,
        Err(ProtocolError::Empty) => return err_line("bad_request", "empty request"),
        Err(e) => {
            metrics::counter!(
                observability::REQUESTS_TOTAL,
                "op" => "invalid",
                "status" => "bad_request"
            )
            .increment(1);
            return err_line("bad_request", &e.to_string());
        }
    };

    let op = observability::op_label(&req);
    let started = Instant::now();

    let result = match req {
        Request::Subscribe { story_id } => {
            if engine.get_story(&story_id).is_none() {
                Err(EngineError::StoryNotFound(story_id))
            } else {
                *subscription = Some((story_id, engine.notify.subscribe(story_id)));
                Ok(json!({"subscribed": story_id}))
            }
        }
        other => execute(engine, other).await,
    };

    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    metrics::counter!(
        observability::REQUESTS_TOTAL,
        "op" => op,
        "status" => status
    )
    .increment(1);

    match result {
        Ok(value) => ok_line(value),
        Err(e) => {
            if e.is_internal() {
                tracing::error!("internal failure serving {op}: {e}");
            }
            engine_err_line(&e)
        }
    }
}

/// Map a request to the engine call it stands for.
async fn execute(engine: &Arc<Engine>, req: Request) -> Result<Value, EngineError> {
    match req {
        // Handshake is handled before the loop; a repeat is harmless.
        Request::Hello { .. } => Ok(json!({"server": "wayfare"})),

        Request::CreateStory(spec) => {
            let story = spec.into_story()?;
            engine.create_story(story.clone()).await?;
            Ok(json!({"story": story}))
        }
        Request::UpdateStory(spec) if spec.id.is_none() => {
            Err(EngineError::LimitExceeded("update_story requires an id"))
        }
        Request::UpdateStory(spec) => {
            let story = spec.into_story()?;
            engine.update_story(story.clone()).await?;
            Ok(json!({"story": story}))
        }
        Request::SetStoryStatus { id, status } => {
            engine.set_story_status(id, status).await?;
            Ok(json!({"id": id, "status": status}))
        }
        Request::DeleteStory { id } => {
            engine.delete_story(id).await?;
            engine.notify.remove(&id);
            Ok(json!({"id": id}))
        }
        Request::GetStory { id } => match engine.story(id).await {
            Some(story) => Ok(json!({"story": story})),
            None => Err(EngineError::StoryNotFound(id)),
        },
        Request::ListStories => {
            let stories = engine.list_stories().await;
            Ok(json!({"total": stories.len(), "stories": stories}))
        }

        Request::CreateBooking(spec) => {
            let booking = engine.create_booking(spec.into_request()?).await?;
            Ok(json!({"booking": booking}))
        }
        Request::CancelBooking { id } => {
            let story_id = engine.cancel_booking(id).await?;
            Ok(json!({"id": id, "story_id": story_id}))
        }
        Request::ResolvePayment { id, outcome } => {
            let story_id = engine.resolve_payment(id, outcome).await?;
            Ok(json!({"id": id, "story_id": story_id, "payment": outcome}))
        }
        Request::GetBooking { id } => match engine.booking(id).await {
            Some(booking) => Ok(json!({"booking": booking})),
            None => Err(EngineError::BookingNotFound(id)),
        },
        Request::StoryBookings { story_id } => {
            let bookings = engine.bookings_for(story_id).await?;
            Ok(json!({"total": bookings.len(), "bookings": bookings}))
        }
        Request::Occupancy {
            story_id,
            date,
            policy,
        } => {
            let date = protocol::parse_date(&date)?;
            let occupancy = engine.occupancy(story_id, date, policy).await?;
            Ok(json!({"story_id": story_id, "date": date, "occupancy": occupancy}))
        }

        Request::Search(spec) => {
            let request = spec.into_request()?;
            let response = engine::search(engine.as_ref(), &request).await?;
            Ok(json!({"total": response.total, "results": response.results}))
        }

        // Handled by the session loop; unreachable here.
        Request::Subscribe { .. } => Err(EngineError::LimitExceeded("subscribe mishandled")),
    }
}
