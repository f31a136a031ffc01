//! The joint client/server state machine of one HTTP/1.1 connection.
//!
//! Each role moves independently. Events drive most transitions; a small set
//! of joint-state rules then runs to a fixpoint:
//!
//! ```text
//!  client: Idle --Request--> SendBody --EndOfMessage--> Done
//!  server: Idle --(client Request)--> SendResponse --Response--> SendBody
//!                                                  --EndOfMessage--> Done
//!
//!  (Closed, Idle|Done) / (Error, Done)  => server MustClose
//!  (Idle|Done, Closed) / (Done, Error)  => client MustClose
//!  keep-alive disabled                  => Done becomes MustClose
//! ```
//!
//! Only `(Done, Done)` can be reset back to `(Idle, Idle)`.

use std::fmt;

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Server only: a request arrived and no final response was sent yet.
    SendResponse,
    SendBody,
    Done,
    MustClose,
    Closed,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "IDLE",
            State::SendResponse => "SEND_RESPONSE",
            State::SendBody => "SEND_BODY",
            State::Done => "DONE",
            State::MustClose => "MUST_CLOSE",
            State::Closed => "CLOSED",
            State::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Event kinds as seen by the state machine, stripped of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Request,
    InformationalResponse,
    Response,
    Data,
    EndOfMessage,
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    client: State,
    server: State,
    keep_alive: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            client: State::Idle,
            server: State::Idle,
            keep_alive: true,
        }
    }

    /// Current `(client, server)` pair.
    pub fn states(&self) -> (State, State) {
        (self.client, self.server)
    }

    pub fn get(&self, role: Role) -> State {
        match role {
            Role::Client => self.client,
            Role::Server => self.server,
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Moves `role` into `Error`. Never fails.
    pub fn process_error(&mut self, role: Role) {
        self.set(role, State::Error);
        self.fire_state_triggered_transitions();
    }

    /// Keep-alive can only ever be switched off within a cycle.
    pub fn process_keep_alive_disabled(&mut self) {
        self.keep_alive = false;
        self.fire_state_triggered_transitions();
    }

    pub fn process_event(&mut self, role: Role, event: EventType) -> Result<(), ProtocolError> {
        self.fire_event_triggered_transition(role, event)?;
        if role == Role::Client && event == EventType::Request {
            self.fire_event_triggered_transition(Role::Server, EventType::Request)?;
        }
        self.fire_state_triggered_transitions();
        Ok(())
    }

    /// Resets `(Done, Done)` to `(Idle, Idle)` for the next request.
    pub fn start_next_cycle(&mut self) -> Result<(), ProtocolError> {
        if self.states() != (State::Done, State::Done) {
            return Err(ProtocolError::local(format!(
                "not in a reusable state: client={} server={}",
                self.client, self.server
            )));
        }
        self.client = State::Idle;
        self.server = State::Idle;
        self.fire_state_triggered_transitions();
        Ok(())
    }

    fn set(&mut self, role: Role, state: State) {
        match role {
            Role::Client => self.client = state,
            Role::Server => self.server = state,
        }
    }

    fn fire_event_triggered_transition(
        &mut self,
        role: Role,
        event: EventType,
    ) -> Result<(), ProtocolError> {
        use EventType as E;
        use State as S;

        let current = self.get(role);
        let next = match (role, current, event) {
            (_, S::Idle, E::ConnectionClosed) => S::Closed,
            (_, S::Done | S::MustClose | S::Closed, E::ConnectionClosed) => S::Closed,
            (_, S::SendBody, E::Data) => S::SendBody,
            (_, S::SendBody, E::EndOfMessage) => S::Done,

            (Role::Client, S::Idle, E::Request) => S::SendBody,

            // Triggered by the client's Request, not sent by the server.
            (Role::Server, S::Idle, E::Request) => S::SendResponse,
            // Error responses may go out before any request was parsed.
            (Role::Server, S::Idle, E::Response) => S::SendBody,
            (Role::Server, S::SendResponse, E::InformationalResponse) => S::SendResponse,
            (Role::Server, S::SendResponse, E::Response) => S::SendBody,

            _ => {
                return Err(ProtocolError::local(format!(
                    "can't handle event type {event:?} when role={role:?} and state={current}"
                )));
            }
        };
        self.set(role, next);
        Ok(())
    }

    fn fire_state_triggered_transitions(&mut self) {
        use State as S;

        loop {
            let start = self.states();

            if !self.keep_alive {
                for role in [Role::Client, Role::Server] {
                    if self.get(role) == S::Done {
                        self.set(role, S::MustClose);
                    }
                }
            }

            match self.states() {
                (S::Closed, S::Done) | (S::Closed, S::Idle) | (S::Error, S::Done) => {
                    self.server = S::MustClose;
                }
                (S::Done, S::Closed) | (S::Idle, S::Closed) | (S::Done, S::Error) => {
                    self.client = S::MustClose;
                }
                _ => {}
            }

            if self.states() == start {
                return;
            }
        }
    }
}
