//! Headless foreground loop.
//!
//! Drives the session manager and the history pipeline and reads operator
//! commands from stdin, one per line. Runs until `quit`, end of input plus
//! Ctrl-C, or Ctrl-C.

use chrono::Utc;
use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::automation::rule::{Rule, RuleScope};
use crate::commands::{CommandConfig, CommandRunner};
use crate::history::{HistoryPipeline, HistoryResult};
use crate::mqtt::config::{ConnectionId, ConnectionProfile, Qos};
use crate::mqtt::mqtt_handler::ConnectionState;
use crate::persistence::config_portal::{ConfigPortal, ConfigResult, PortalAction};
use crate::records::{apply_command, apply_profile, apply_rule, split_fields, Fields};
use crate::session::events::UiEvent;
use crate::session::manager::SessionManager;

/// Messages shown per chunk before yielding back to the loop.
const HISTORY_CHUNK: usize = 25;

const HELP: &str = "\
commands:
  profiles                      list connection profiles
  profile add <field=value..>   fields: name host port user pass client clean keepalive tls ca cert key
  profile edit <id> <field=value..>
  profile rm <id>               delete a profile with its history
  rule list | rule add <field=value..> | rule edit <id> <field=value..>
                                fields: name enabled topic when value reply payload qos retain delay conn
  rule enable <id> | rule disable <id> | rule rm <id>
  command list | command add <field=value..> | command edit <id> <field=value..> | command rm <id>
                                fields: name topic payload qos retain loop interval conn
  connect <id> | disconnect <id>
  active <id>                   show a connection and load its history
  pub <topic> [payload]         publish on the active connection
  sub <filter> [qos] | unsub <filter>
  clear                         hide the shown history
  purge                         delete the stored history of the active connection
  rules                         reload automation rules
  topics [clear]                recently published topics
  send <command> | loop <command> | stop <command>
  quit";

/// Stored record kinds editable from the console.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Record {
    Profile,
    Rule,
    Command,
}

impl Record {
    fn name(self) -> &'static str {
        match self {
            Record::Profile => "profile",
            Record::Rule => "rule",
            Record::Command => "command",
        }
    }
}

#[derive(Debug, PartialEq)]
enum Edit {
    List,
    Add(Fields),
    Change(i64, Fields),
    Enable(i64, bool),
    Remove(i64),
}

impl Edit {
    fn parse(record: Record, rest: &str) -> Result<Self, String> {
        let (verb, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();
        let id = |args: &str| -> Result<i64, String> {
            args.parse::<i64>().map_err(|_| format!("{verb} expects a numeric id"))
        };

        match verb {
            "" | "list" => Ok(Edit::List),
            "add" => Ok(Edit::Add(split_fields(args)?)),
            "edit" => {
                let (target, fields) = args.split_once(char::is_whitespace).unwrap_or((args, ""));
                Ok(Edit::Change(id(target)?, split_fields(fields)?))
            }
            "enable" | "disable" if record == Record::Rule => Ok(Edit::Enable(id(args)?, verb == "enable")),
            "rm" => Ok(Edit::Remove(id(args)?)),
            other => Err(format!("unknown {} action '{other}', try 'help'", record.name())),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Input {
    Manage(Record, Edit),
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    Active(ConnectionId),
    Publish { topic: String, payload: String },
    Subscribe { filter: String, qos: Qos },
    Unsubscribe(String),
    Clear,
    Purge,
    Rules,
    Topics { clear: bool },
    Send(i64),
    Loop(i64),
    Stop(i64),
    Help,
    Quit,
}

impl Input {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let id = |what: &str| -> Result<i64, String> {
            rest.parse::<i64>().map_err(|_| format!("{what} expects a numeric id"))
        };

        match word {
            "profiles" => Ok(Input::Manage(Record::Profile, Edit::List)),
            "profile" => Ok(Input::Manage(Record::Profile, Edit::parse(Record::Profile, rest)?)),
            "rule" => Ok(Input::Manage(Record::Rule, Edit::parse(Record::Rule, rest)?)),
            "command" => Ok(Input::Manage(Record::Command, Edit::parse(Record::Command, rest)?)),
            "remove" => Ok(Input::Manage(Record::Profile, Edit::Remove(id("remove")?))),
            "connect" => Ok(Input::Connect(ConnectionId(id("connect")?))),
            "disconnect" => Ok(Input::Disconnect(ConnectionId(id("disconnect")?))),
            "active" => Ok(Input::Active(ConnectionId(id("active")?))),
            "pub" => {
                let (topic, payload) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if topic.is_empty() {
                    return Err("pub expects a topic".to_string());
                }
                Ok(Input::Publish {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
            }
            "sub" => {
                let mut parts = rest.split_whitespace();
                let filter = parts.next().ok_or("sub expects a filter")?;
                let qos = match parts.next() {
                    Some(level) => Qos::from_level(level.parse().map_err(|_| "qos must be 0, 1 or 2")?),
                    None => Qos::AtMostOnce,
                };
                Ok(Input::Subscribe {
                    filter: filter.to_string(),
                    qos,
                })
            }
            "unsub" if !rest.is_empty() => Ok(Input::Unsubscribe(rest.to_string())),
            "unsub" => Err("unsub expects a filter".to_string()),
            "clear" => Ok(Input::Clear),
            "purge" => Ok(Input::Purge),
            "rules" => Ok(Input::Rules),
            "topics" => Ok(Input::Topics { clear: rest == "clear" }),
            "send" => Ok(Input::Send(id("send")?)),
            "loop" => Ok(Input::Loop(id("loop")?)),
            "stop" => Ok(Input::Stop(id("stop")?)),
            "help" | "?" => Ok(Input::Help),
            "quit" | "exit" => Ok(Input::Quit),
            other => Err(format!("unknown command '{other}', try 'help'")),
        }
    }
}

pub struct Console {
    manager: SessionManager,
    history: HistoryPipeline,
    commands: CommandRunner,
    portal: Arc<ConfigPortal>,
}

impl Console {
    pub fn new(manager: SessionManager, history: HistoryPipeline, portal: Arc<ConfigPortal>) -> Self {
        Self {
            manager,
            history,
            commands: CommandRunner::new(),
            portal,
        }
    }

    /// Makes `connection_id` the displayed connection and starts loading its history.
    pub fn activate(&mut self, connection_id: ConnectionId) {
        self.manager.set_active(Some(connection_id));
        self.history.load_history(connection_id);
    }

    pub fn manager_mut(&mut self) -> &mut SessionManager {
        &mut self.manager
    }

    pub async fn run(self) -> Result<()> {
        self.run_with(BufReader::new(tokio::io::stdin()), tokio::signal::ctrl_c())
            .await
    }

    /// Serves `input` line by line until `quit`, the event streams close or
    /// `interrupt` resolves. The interrupt is polled from one pinned future
    /// for the whole run.
    async fn run_with<R, I>(mut self, input: R, interrupt: I) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        I: Future<Output = std::io::Result<()>>,
    {
        let mut ui = self.manager.subscribe();
        let mut lines = input.lines();
        let mut stdin_open = true;
        tokio::pin!(interrupt);
        info!("Console ready, type 'help' for commands");

        loop {
            tokio::select! {
                _ = &mut interrupt => {
                    info!("Interrupted");
                    break;
                }
                Some(event) = self.manager.next_event() => self.manager.handle_event(event),
                Some(result) = self.history.next_result() => self.deliver_history(result).await,
                event = ui.recv() => match event {
                    Ok(event) => show(&event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind, events skipped"),
                    Err(RecvError::Closed) => break,
                },
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match Input::parse(&line) {
                        Ok(Input::Quit) => break,
                        Ok(input) => self.execute(input),
                        Err(reason) => println!("{reason}"),
                    },
                    Ok(None) => {
                        debug!("Input closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read input: {}", e);
                        stdin_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn execute(&mut self, input: Input) {
        let active = self.manager.active();
        let outcome = match input {
            Input::Manage(Record::Profile, edit) => self.manage_profile(edit),
            Input::Manage(Record::Rule, edit) => self.manage_rule(edit),
            Input::Manage(Record::Command, edit) => self.manage_command(edit),
            Input::Connect(id) => self.manager.request_connect(id).map_err(|e| e.to_string()),
            Input::Disconnect(id) => self.manager.request_disconnect(id).map_err(|e| e.to_string()),
            Input::Active(id) => {
                self.activate(id);
                Ok(())
            }
            Input::Publish { topic, payload } => match active {
                Some(id) => self.publish(id, topic, payload),
                None => Err("no active connection".to_string()),
            },
            Input::Subscribe { filter, qos } => match active {
                Some(id) => self
                    .manager
                    .subscribe_topic(id, &filter, qos)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                None => Err("no active connection".to_string()),
            },
            Input::Unsubscribe(filter) => match active {
                Some(id) => self
                    .manager
                    .unsubscribe_topic(id, &filter)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                None => Err("no active connection".to_string()),
            },
            Input::Clear => match active {
                Some(id) => {
                    self.history.mark_display_cleared(id, Utc::now());
                    Ok(())
                }
                None => Err("no active connection".to_string()),
            },
            Input::Purge => match active {
                Some(id) => self.history.clear_history(id).map(|_| ()).map_err(|e| e.to_string()),
                None => Err("no active connection".to_string()),
            },
            Input::Rules => {
                self.manager.reload_rules();
                Ok(())
            }
            Input::Topics { clear: true } => match self.portal.execute_portal_action(PortalAction::ClearTopicHistory) {
                ConfigResult::Failed(e) => Err(e.to_string()),
                _ => Ok(()),
            },
            Input::Topics { clear: false } => match self.portal.execute_portal_action(PortalAction::GetTopicHistory) {
                ConfigResult::Topics(topics) => {
                    for topic in topics {
                        println!("  {topic}");
                    }
                    Ok(())
                }
                ConfigResult::Failed(e) => Err(e.to_string()),
                other => Err(format!("unexpected settings result: {other:?}")),
            },
            Input::Send(command_id) => self.send_command(command_id, active),
            Input::Loop(command_id) => self.loop_command(command_id, active),
            Input::Stop(command_id) => {
                if !self.commands.stop_loop(command_id) {
                    println!("command {command_id} is not looping");
                }
                Ok(())
            }
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Quit => Ok(()),
        };

        if let Err(reason) = outcome {
            warn!("{}", reason);
        }
    }

    fn manage_profile(&mut self, edit: Edit) -> Result<(), String> {
        let profiles = self.manager.store().profiles();
        match edit {
            Edit::List => {
                for profile in profiles.list().map_err(|e| e.to_string())? {
                    let state = self
                        .manager
                        .state(profile.id)
                        .map_or("idle".to_string(), |state| format!("{state:?}").to_lowercase());
                    let unread = self.manager.unread_count(profile.id);
                    println!("{:>4}  {}  [{}] unread {}", profile.id.0, profile, state, unread);
                }
            }
            Edit::Add(fields) => {
                let mut profile = ConnectionProfile::default();
                apply_profile(&mut profile, &fields)?;
                let profile = profiles.insert(&profile).map_err(|e| e.to_string())?;
                println!("profile {} created", profile.id);
            }
            Edit::Change(id, fields) => {
                let id = ConnectionId(id);
                let mut profile = profiles.get(id).map_err(|e| e.to_string())?;
                apply_profile(&mut profile, &fields)?;
                profiles.update(&profile).map_err(|e| e.to_string())?;
                if self.manager.state(id).is_some_and(|state| state != ConnectionState::Disconnected) {
                    println!("profile {id} updated, reconnect to apply");
                }
            }
            Edit::Remove(id) => {
                let id = ConnectionId(id);
                self.history.forget(id);
                self.manager.remove_profile(id).map_err(|e| e.to_string())?;
            }
            Edit::Enable(..) => return Err("profiles cannot be enabled".to_string()),
        }
        Ok(())
    }

    fn manage_rule(&mut self, edit: Edit) -> Result<(), String> {
        let rules = self.manager.store().rules();
        match edit {
            Edit::List => {
                for rule in rules.list().map_err(|e| e.to_string())? {
                    let scope = match rule.scope {
                        RuleScope::All => "all".to_string(),
                        RuleScope::Connection(id) => id.to_string(),
                    };
                    println!(
                        "{:>4}  {} [{}] {} {} '{}' -> {} ({})",
                        rule.id,
                        rule.name,
                        if rule.enabled { "on" } else { "off" },
                        rule.trigger_topic,
                        rule.condition,
                        rule.condition_value,
                        rule.response_topic,
                        scope
                    );
                }
                return Ok(());
            }
            Edit::Add(fields) => {
                let mut rule = Rule::default();
                apply_rule(&mut rule, &fields)?;
                let rule = rules.insert(&rule).map_err(|e| e.to_string())?;
                println!("rule {} created", rule.id);
            }
            Edit::Change(id, fields) => {
                let mut rule = rules.get(id).map_err(|e| e.to_string())?;
                apply_rule(&mut rule, &fields)?;
                rules.update(&rule).map_err(|e| e.to_string())?;
            }
            Edit::Enable(id, enabled) => {
                let mut rule = rules.get(id).map_err(|e| e.to_string())?;
                rule.enabled = enabled;
                rules.update(&rule).map_err(|e| e.to_string())?;
            }
            Edit::Remove(id) => rules.delete(id).map_err(|e| e.to_string())?,
        }
        self.manager.reload_rules();
        Ok(())
    }

    fn manage_command(&mut self, edit: Edit) -> Result<(), String> {
        let commands = self.manager.store().commands();
        match edit {
            Edit::List => {
                for command in commands.list().map_err(|e| e.to_string())? {
                    let scope = command.connection_id.map_or("all".to_string(), |id| id.to_string());
                    println!(
                        "{:>4}  {}  {} '{}' qos {} ({})",
                        command.id,
                        command.name,
                        command.topic,
                        command.payload,
                        command.qos.level(),
                        scope
                    );
                }
            }
            Edit::Add(fields) => {
                let mut command = CommandConfig::default();
                apply_command(&mut command, &fields)?;
                let command = commands.insert(&command).map_err(|e| e.to_string())?;
                println!("command {} created", command.id);
            }
            Edit::Change(id, fields) => {
                let mut command = commands.get(id).map_err(|e| e.to_string())?;
                apply_command(&mut command, &fields)?;
                commands.update(&command).map_err(|e| e.to_string())?;
            }
            Edit::Remove(id) => {
                self.commands.stop_loop(id);
                commands.delete(id).map_err(|e| e.to_string())?;
            }
            Edit::Enable(..) => return Err("commands cannot be enabled".to_string()),
        }
        Ok(())
    }

    fn publish(&mut self, id: ConnectionId, topic: String, payload: String) -> Result<(), String> {
        self.manager
            .publish(id, topic.clone(), payload.into_bytes(), Qos::AtMostOnce, false)
            .map_err(|e| e.to_string())?;
        if let ConfigResult::Failed(e) = self.portal.execute_portal_action(PortalAction::PushTopic(topic)) {
            warn!("Failed to update topic history: {}", e);
        }
        Ok(())
    }

    fn send_command(&mut self, command_id: i64, active: Option<ConnectionId>) -> Result<(), String> {
        let command = self.manager.store().commands().get(command_id).map_err(|e| e.to_string())?;
        let target = command
            .connection_id
            .or(active)
            .ok_or("command has no connection and none is active")?;
        self.commands
            .send(&mut self.manager, target, &command)
            .map_err(|e| e.to_string())
    }

    fn loop_command(&mut self, command_id: i64, active: Option<ConnectionId>) -> Result<(), String> {
        let command = self.manager.store().commands().get(command_id).map_err(|e| e.to_string())?;
        let target = command
            .connection_id
            .or(active)
            .ok_or("command has no connection and none is active")?;
        let link = self
            .manager
            .session_link(target)
            .ok_or_else(|| format!("connection {target} has no session"))?;
        match self.commands.start_loop(command, link) {
            Ok(true) => Ok(()),
            Ok(false) => {
                println!("command {command_id} is already looping");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn deliver_history(&mut self, result: HistoryResult) {
        let Some(batch) = self.history.reconcile(result, self.manager.active()) else {
            return;
        };
        println!("-- history of {} ({} messages) --", batch.connection_id, batch.len());
        for chunk in batch.into_chunks(HISTORY_CHUNK) {
            for message in chunk {
                println!("{message}");
            }
            tokio::task::yield_now().await;
        }
    }

    async fn shutdown(mut self) {
        info!("Shutting down");
        self.commands.stop_all();
        self.manager.shutdown().await;
        if let Err(e) = self.portal.save().await {
            error!("Failed to save settings: {}", e);
        }
    }
}

fn show(event: &UiEvent) {
    match event {
        UiEvent::Connected(id) => println!("{id} connected"),
        UiEvent::Disconnected(id) => println!("{id} disconnected"),
        UiEvent::MessageReceived(message) | UiEvent::MessagePublished(message) => println!("{message}"),
        UiEvent::ErrorOccurred { connection_id, error } => println!("{connection_id} error: {error}"),
        UiEvent::UnreadCountChanged { connection_id, count } => {
            debug!(connection = %connection_id, count, "Unread count changed")
        }
    }
}
