//! Actions declared on schema nodes.
//!
//! An action is a templated operation executed when configuration changes:
//! either a remote call on the bus or an external program invocation. Both
//! kinds are parsed once at schema load and expanded against a
//! configuration-node context at execution time.

use std::fmt;

use rtkit_bus::{CallRequest, ReturnSpec, SignatureDb};

use crate::error::Error;
use crate::expand::Template;

/// The schema clauses an action can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    Create,
    Activate,
    Update,
    Delete,
    Set,
    Get,
    List,
}

impl ActionKind {
    #[must_use]
    pub fn clause(self) -> &'static str {
        match self {
            ActionKind::Create => "%create",
            ActionKind::Activate => "%activate",
            ActionKind::Update => "%update",
            ActionKind::Delete => "%delete",
            ActionKind::Set => "%set",
            ActionKind::Get => "%get",
            ActionKind::List => "%list",
        }
    }

    #[must_use]
    pub fn from_clause(clause: &str) -> Option<Self> {
        Some(match clause {
            "%create" => ActionKind::Create,
            "%activate" => ActionKind::Activate,
            "%update" => ActionKind::Update,
            "%delete" => ActionKind::Delete,
            "%set" => ActionKind::Set,
            "%get" => ActionKind::Get,
            "%list" => ActionKind::List,
            _ => return None,
        })
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.clause())
    }
}

/// A templated remote call:
/// `target/interface/method?arg:type=$(var)&… -> ret:type=$var&…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    raw: String,
    request: Template,
    return_spec: ReturnSpec,
}

impl RemoteAction {
    /// Parses the declaration text.
    ///
    /// # Errors
    /// Returns a parse error on malformed templates or return specs.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let (request_text, return_text) = match text.split_once("->") {
            Some((req, ret)) => (req.trim(), ret.trim()),
            None => (text.trim(), ""),
        };
        let request = Template::parse(request_text)?;
        let return_spec = ReturnSpec::parse(return_text).map_err(|e| Error::Parse {
            source_hint: text.to_owned(),
            line: 1,
            message: format!("bad return spec: {e}"),
        })?;
        Ok(RemoteAction {
            raw: text.to_owned(),
            request,
            return_spec,
        })
    }

    /// The value-free signature of the request side, for signature-database
    /// validation: `target/interface/method?name:type&…`.
    #[must_use]
    pub fn signature(&self) -> String {
        let raw = self.request.raw();
        match raw.split_once('?') {
            None => raw.trim().to_owned(),
            Some((head, query)) => {
                let args: Vec<&str> = query
                    .split('&')
                    .map(|pair| pair.split_once('=').map_or(pair, |(decl, _)| decl))
                    .collect();
                format!("{}?{}", head.trim(), args.join("&"))
            }
        }
    }

    /// The literal target name, when the template starts with one.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        let raw = self.request.raw();
        let head = raw.split('?').next().unwrap_or(raw);
        let target = head.split('/').next().unwrap_or("");
        (!target.is_empty() && !target.contains("$(")).then_some(target)
    }

    #[must_use]
    pub fn return_spec(&self) -> &ReturnSpec {
        &self.return_spec
    }

    #[must_use]
    pub fn request_template(&self) -> &Template {
        &self.request
    }

    /// Expands the request against a variable context.
    ///
    /// # Errors
    /// [`Error::UnresolvedVariable`] when a reference does not resolve;
    /// a parse error when the expanded text is not a well-formed request.
    pub fn expand(
        &self,
        resolve_var: impl FnMut(&str) -> Option<String>,
        resolve_expr: impl FnMut(&str) -> Option<String>,
    ) -> Result<CallRequest, Error> {
        let expanded = self.request.expand(resolve_var, resolve_expr)?;
        CallRequest::parse(&expanded).map_err(|e| Error::Parse {
            source_hint: self.raw.clone(),
            line: 1,
            message: format!("expanded request is malformed: {e}"),
        })
    }
}

/// A templated program invocation:
/// `path arg… -> stdout=$var stderr=$var`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramAction {
    raw: String,
    command: Template,
    stdout_var: Option<String>,
    stderr_var: Option<String>,
}

/// A fully expanded program invocation, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInvocation {
    pub executable: String,
    pub args: Vec<String>,
}

impl ProgramAction {
    /// Parses the declaration text.
    ///
    /// # Errors
    /// Returns a parse error on malformed templates or capture specs.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let (command_text, capture_text) = match text.split_once("->") {
            Some((cmd, cap)) => (cmd.trim(), cap.trim()),
            None => (text.trim(), ""),
        };
        if command_text.is_empty() {
            return Err(Error::Parse {
                source_hint: text.to_owned(),
                line: 1,
                message: "empty program action".to_owned(),
            });
        }
        let command = Template::parse(command_text)?;

        let mut stdout_var = None;
        let mut stderr_var = None;
        for part in capture_text.split_whitespace() {
            let bad = |message: String| Error::Parse {
                source_hint: text.to_owned(),
                line: 1,
                message,
            };
            let (stream, var) = part
                .split_once('=')
                .ok_or_else(|| bad(format!("bad capture spec '{part}'")))?;
            let var = var
                .strip_prefix('$')
                .ok_or_else(|| bad(format!("capture '{part}' must name a $variable")))?;
            match stream {
                "stdout" => stdout_var = Some(var.to_owned()),
                "stderr" => stderr_var = Some(var.to_owned()),
                other => return Err(bad(format!("unknown capture stream '{other}'"))),
            }
        }

        Ok(ProgramAction {
            raw: text.to_owned(),
            command,
            stdout_var,
            stderr_var,
        })
    }

    #[must_use]
    pub fn stdout_var(&self) -> Option<&str> {
        self.stdout_var.as_deref()
    }

    #[must_use]
    pub fn stderr_var(&self) -> Option<&str> {
        self.stderr_var.as_deref()
    }

    #[must_use]
    pub fn command_template(&self) -> &Template {
        &self.command
    }

    /// Expands the command line and splits it into executable and argv.
    ///
    /// # Errors
    /// [`Error::UnresolvedVariable`] when a reference does not resolve; a
    /// parse error when the expanded line cannot be split or is empty.
    pub fn expand(
        &self,
        resolve_var: impl FnMut(&str) -> Option<String>,
        resolve_expr: impl FnMut(&str) -> Option<String>,
    ) -> Result<ProgramInvocation, Error> {
        let expanded = self.command.expand(resolve_var, resolve_expr)?;
        let mut words = shlex::split(&expanded).ok_or_else(|| Error::Parse {
            source_hint: self.raw.clone(),
            line: 1,
            message: format!("cannot split command line '{expanded}'"),
        })?;
        if words.is_empty() {
            return Err(Error::Parse {
                source_hint: self.raw.clone(),
                line: 1,
                message: "expanded command line is empty".to_owned(),
            });
        }
        let executable = words.remove(0);
        Ok(ProgramInvocation {
            executable,
            args: words,
        })
    }
}

/// An action: a remote call or a program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Remote(RemoteAction),
    Program(ProgramAction),
}

impl Action {
    /// Parses an action body: `kind` is `xrl` or `program`, `body` the
    /// quoted declaration text.
    ///
    /// # Errors
    /// Returns a parse error for unknown kinds or malformed bodies.
    pub fn parse(kind: &str, body: &str) -> Result<Self, Error> {
        match kind {
            "xrl" => RemoteAction::parse(body).map(Action::Remote),
            "program" => ProgramAction::parse(body).map(Action::Program),
            other => Err(Error::Parse {
                source_hint: body.to_owned(),
                line: 1,
                message: format!("unknown action kind '{other}'"),
            }),
        }
    }

    /// The variables this action refers to.
    pub fn referred_variables(&self) -> impl Iterator<Item = &str> {
        match self {
            Action::Remote(a) => a.request.referred_variables(),
            Action::Program(a) => a.command.referred_variables(),
        }
    }

    /// Checks a remote action against the signature database. Program
    /// actions always pass.
    ///
    /// # Errors
    /// Returns a schema violation naming the unknown signature.
    pub fn check_signature(&self, sigdb: &SignatureDb) -> Result<(), Error> {
        if let Action::Remote(remote) = self {
            let signature = remote.signature();
            if !sigdb.contains(&signature) {
                return Err(Error::SchemaViolation {
                    path: signature.clone(),
                    message: format!("remote call '{signature}' is not a known signature"),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        match self {
            Action::Remote(a) => &a.raw,
            Action::Program(a) => &a.raw,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Remote(a) => write!(f, "xrl \"{}\"", a.raw),
            Action::Program(a) => write!(f, "program \"{}\"", a.raw),
        }
    }
}
