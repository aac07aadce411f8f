//! Line console: stdin commands in, rendered mesh events out.

use palmesh_core::{MeshEvent, User};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;
use uuid::Uuid;

use crate::transport::SharedRouter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Private { to: Uuid, text: String },
    Users,
    Fingerprint(Option<Uuid>),
    Quit,
    Nothing,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command /{0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("not a user id: {0}")]
    BadId(String),
}

pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Nothing);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Broadcast(line.to_string()));
    };
    let (cmd, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    match cmd {
        "msg" => {
            let (id, text) = args
                .split_once(' ')
                .ok_or(ParseError::Usage("/msg <user id> <text>"))?;
            let text = text.trim();
            if text.is_empty() {
                return Err(ParseError::Usage("/msg <user id> <text>"));
            }
            Ok(Command::Private {
                to: parse_id(id)?,
                text: text.to_string(),
            })
        }
        "users" => Ok(Command::Users),
        "fingerprint" if args.is_empty() => Ok(Command::Fingerprint(None)),
        "fingerprint" => Ok(Command::Fingerprint(Some(parse_id(args)?))),
        "quit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

fn parse_id(s: &str) -> Result<Uuid, ParseError> {
    Uuid::parse_str(s).map_err(|_| ParseError::BadId(s.to_string()))
}

fn names(users: &[User]) -> String {
    users
        .iter()
        .map(|u| u.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn render(event: &MeshEvent) -> String {
    match event {
        MeshEvent::UserJoined(u) => format!("* {} joined ({})", u.name, u.id),
        MeshEvent::RosterSynced(users) => format!("* already here: {}", names(users)),
        MeshEvent::UsersLeft(users) => format!("* left: {}", names(users)),
        MeshEvent::BroadcastReceived(m) => format!("<{}> {}", m.from.name, m.text),
        MeshEvent::PrivateReceived(m) => format!("[private] <{}> {}", m.from.name, m.text),
    }
}

/// Print events until the router goes away; run stdin commands until `/quit` or EOF.
pub async fn run_console(
    router: SharedRouter,
    mut events: UnboundedReceiver<MeshEvent>,
) -> anyhow::Result<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render(&event));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Ok(c) => c,
            Err(e) => {
                println!("! {}", e);
                continue;
            }
        };
        let mut r = router.lock().await;
        match command {
            Command::Nothing => {}
            Command::Quit => return Ok(()),
            Command::Broadcast(text) => {
                if let Err(e) = r.send_broadcast(text) {
                    warn!(error = %e, "broadcast failed");
                }
            }
            Command::Private { to, text } => {
                if let Err(e) = r.send_private(to, &text) {
                    println!("! {}", e);
                }
            }
            Command::Users => {
                let local = r.local_user().id;
                for u in r.users() {
                    let note = if u.id == local {
                        " (you)"
                    } else if !r.can_message(&u.id) {
                        " (no key)"
                    } else {
                        ""
                    };
                    println!("  {} {}{}", u.id, u.name, note);
                }
            }
            Command::Fingerprint(None) => println!("  {}", r.local_fingerprint()),
            Command::Fingerprint(Some(id)) => match r.fingerprint(&id) {
                Ok(fp) => println!("  {}", fp),
                Err(e) => println!("! {}", e),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use palmesh_core::Message;

    #[test]
    fn plain_line_broadcasts() {
        assert_eq!(
            parse_line("  hello all "),
            Ok(Command::Broadcast("hello all".into()))
        );
        assert_eq!(parse_line("   "), Ok(Command::Nothing));
    }

    #[test]
    fn msg_needs_id_and_text() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse_line(&format!("/msg {} hi there", id)),
            Ok(Command::Private {
                to: id,
                text: "hi there".into()
            })
        );
        assert!(matches!(parse_line(&format!("/msg {}", id)), Err(ParseError::Usage(_))));
        assert_eq!(
            parse_line("/msg bob hi"),
            Err(ParseError::BadId("bob".into()))
        );
    }

    #[test]
    fn other_commands() {
        let id = Uuid::new_v4();
        assert_eq!(parse_line("/users"), Ok(Command::Users));
        assert_eq!(parse_line("/fingerprint"), Ok(Command::Fingerprint(None)));
        assert_eq!(
            parse_line(&format!("/fingerprint {}", id)),
            Ok(Command::Fingerprint(Some(id)))
        );
        assert_eq!(parse_line("/quit"), Ok(Command::Quit));
        assert_eq!(parse_line("/nope"), Err(ParseError::Unknown("nope".into())));
    }

    #[test]
    fn renders_events() {
        let alice = User::new("alice");
        let bob = User::new("bob");
        assert_eq!(
            render(&MeshEvent::BroadcastReceived(Message {
                from: alice.clone(),
                text: "hi".into()
            })),
            "<alice> hi"
        );
        assert_eq!(
            render(&MeshEvent::UsersLeft(vec![alice, bob])),
            "* left: alice, bob"
        );
    }
}
