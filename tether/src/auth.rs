// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! User authentication: methods, credentials and the ordered retry flow.

use std::collections::VecDeque;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use ssh_key::PrivateKey;

use crate::helpers::NameList;

/// A method name from RFC 4252, without the credential that goes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    None,
    Password,
    PublicKey,
    HostBased,
    KeyboardInteractive,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Password => "password",
            Self::PublicKey => "publickey",
            Self::HostBased => "hostbased",
            Self::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl FromStr for MethodKind {
    type Err = ();

    fn from_str(name: &str) -> Result<MethodKind, Self::Err> {
        match name {
            "none" => Ok(Self::None),
            "password" => Ok(Self::Password),
            "publickey" => Ok(Self::PublicKey),
            "hostbased" => Ok(Self::HostBased),
            "keyboard-interactive" => Ok(Self::KeyboardInteractive),
            _ => Err(()),
        }
    }
}

/// An ordered set of authentication methods. Order is the order the server
/// listed them in; unknown names are dropped on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSet(Vec<MethodKind>);

impl Deref for MethodSet {
    type Target = [MethodKind];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&NameList> for MethodSet {
    fn from(list: &NameList) -> Self {
        Self(
            list.0
                .iter()
                .filter_map(|name| name.parse().ok())
                .collect(),
        )
    }
}

impl MethodSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Every method the engine knows about. Used before the server has
    /// stated any restriction.
    pub fn all() -> Self {
        Self(vec![
            MethodKind::None,
            MethodKind::Password,
            MethodKind::PublicKey,
            MethodKind::HostBased,
            MethodKind::KeyboardInteractive,
        ])
    }

    pub fn contains(&self, method: MethodKind) -> bool {
        self.0.contains(&method)
    }

    pub fn remove(&mut self, method: MethodKind) {
        self.0.retain(|x| *x != method);
    }

    /// Append a method, moving it to the end if it was already present.
    pub fn push(&mut self, method: MethodKind) {
        self.remove(method);
        self.0.push(method);
    }
}

/// The outcome of one authentication attempt, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure {
        /// Methods the server is still willing to accept.
        remaining_methods: MethodSet,
        /// True when the attempt was accepted but the server wants more.
        partial_success: bool,
    },
}

impl AuthResult {
    pub fn success(&self) -> bool {
        matches!(self, AuthResult::Success)
    }
}

/// One credential, consumed by one authentication attempt.
#[derive(Debug, Clone)]
pub enum Method {
    None,
    Password { password: String },
    PublicKey { key: Arc<PrivateKey> },
}

impl Method {
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::None => MethodKind::None,
            Method::Password { .. } => MethodKind::Password,
            Method::PublicKey { .. } => MethodKind::PublicKey,
        }
    }
}

/// Drives ordered credentials against the server's remaining-methods set,
/// under a fixed attempt budget.
///
/// A failed credential is consumed; further credentials of the same kind
/// may still be attempted while the server keeps offering the method. When
/// `next()` returns `None` the caller reports
/// [`AuthenticationExhausted`][crate::Error::AuthenticationExhausted].
#[derive(Debug)]
pub struct AuthFlow {
    credentials: VecDeque<Method>,
    remaining: MethodSet,
    attempts_left: usize,
}

impl AuthFlow {
    pub fn new(credentials: impl IntoIterator<Item = Method>, attempt_limit: usize) -> Self {
        Self {
            credentials: credentials.into_iter().collect(),
            remaining: MethodSet::all(),
            attempts_left: attempt_limit,
        }
    }

    /// The next credential to attempt: the first one whose method the
    /// server still allows. `None` once the attempt budget or the usable
    /// credentials run out.
    pub fn next(&mut self) -> Option<Method> {
        if self.attempts_left == 0 {
            return None;
        }
        let position = self
            .credentials
            .iter()
            .position(|c| self.remaining.contains(c.kind()))?;
        self.attempts_left -= 1;
        self.credentials.remove(position)
    }

    /// Record a failed attempt: the server's remaining-methods list
    /// replaces the allowed set. On partial success the flow simply keeps
    /// going; only a success response ends it.
    pub fn on_failure(&mut self, remaining_methods: MethodSet) {
        self.remaining = remaining_methods;
    }
}
