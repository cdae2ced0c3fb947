//! A small memcached stand-in for tests.
//!
//! Serves any number of connections from one shared map and can answer
//! slowly. TTLs are accepted and ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

#[derive(Default)]
struct Items {
    values: HashMap<String, (String, u64)>,
    next_cas: u64,
}

/// Start a server answering immediately. Returns its address.
pub(crate) async fn spawn() -> String {
    spawn_with_delay(Duration::ZERO).await
}

/// Start a server that waits `delay` before every reply.
pub(crate) async fn spawn_with_delay(delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let items = Arc::new(Mutex::new(Items::default()));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket, items.clone(), delay));
        }
    });

    addr
}

/// An address nothing listens on.
pub(crate) async fn unreachable() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

async fn serve(socket: TcpStream, items: Arc<Mutex<Items>>, delay: Duration) {
    let mut conn = BufStream::new(socket);

    loop {
        let mut line = String::new();
        match conn.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<String> = line.trim_end().split(' ').map(String::from).collect();

        let mut data = None;
        if matches!(parts[0].as_str(), "add" | "set" | "cas") {
            let mut block = String::new();
            if conn.read_line(&mut block).await.is_err() {
                return;
            }
            data = Some(block.trim_end().to_string());
        }

        // Apply the command before the delay so a slow reply still lands
        let reply = apply(&mut *items.lock().await, &parts, data);

        tokio::time::sleep(delay).await;
        if conn.write_all(reply.as_bytes()).await.is_err() || conn.flush().await.is_err() {
            return;
        }
    }
}

fn apply(items: &mut Items, parts: &[String], data: Option<String>) -> String {
    match (parts[0].as_str(), data) {
        ("incr", _) => {
            let cas = items.next_cas + 1;
            match items.values.get_mut(&parts[1]) {
                Some((value, version)) => {
                    let n = value.parse::<u64>().unwrap() + parts[2].parse::<u64>().unwrap();
                    *value = n.to_string();
                    *version = cas;
                    items.next_cas = cas;
                    format!("{}\r\n", n)
                }
                None => "NOT_FOUND\r\n".to_string(),
            }
        }
        ("gets", _) => match items.values.get(&parts[1]) {
            Some((value, cas)) => format!(
                "VALUE {} 0 {} {}\r\n{}\r\nEND\r\n",
                parts[1],
                value.len(),
                cas,
                value
            ),
            None => "END\r\n".to_string(),
        },
        (verb, Some(data)) => {
            let key = parts[1].clone();
            let stored = match verb {
                "add" => !items.values.contains_key(&key),
                "set" => true,
                _ => {
                    let unique: u64 = parts[5].parse().unwrap();
                    match items.values.get(&key) {
                        Some((_, cas)) => *cas == unique,
                        None => return "NOT_FOUND\r\n".to_string(),
                    }
                }
            };
            if stored {
                items.next_cas += 1;
                let cas = items.next_cas;
                items.values.insert(key, (data, cas));
                "STORED\r\n".to_string()
            } else if verb == "cas" {
                "EXISTS\r\n".to_string()
            } else {
                "NOT_STORED\r\n".to_string()
            }
        }
        _ => "ERROR\r\n".to_string(),
    }
}
