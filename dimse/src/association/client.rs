//! Association requester module
//!
//! The module provides the options for requesting an association
//! in which this application entity is the requestor.
//! See [`ClientAssociationOptions`](self::ClientAssociationOptions)
//! for details and examples on how to create an association.
use std::{
    borrow::Cow,
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use snafu::{ensure, ResultExt};
use tracing::debug;

use super::{
    session::{Association, SessionOptions},
    uid::trim_uid,
    ConnectSnafu, MissingAbstractSyntaxSnafu, Result,
};
use crate::{
    pdu::{
        AssociationRQ, PresentationContextProposed, RoleSelection, UserIdentity,
        UserVariableItem,
    },
    service::ServiceRegistry,
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

/// A DICOM association builder for a client node.
/// The final outcome is an [`Association`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_dimse::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .establish("129.168.0.5:104")?;
/// let rsp = association.cecho(1)?.wait_final()?;
/// association.release(true)?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// and supplying both an abstract syntax and list of transfer syntaxes.
///
/// A helper method [`with_abstract_syntax`](Self::with_abstract_syntax) will
/// include by default the transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_
/// in the resulting presentation context.
///
/// Requests which the peer sends over the association
/// (such as the C-STORE requests of a C-GET)
/// are dispatched to the [service registry](Self::service_registry),
/// which is empty by default.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the SCP/SCU role selections to propose
    role_selections: Vec<RoleSelection>,
    /// the user identity to negotiate, if any
    user_identity: Option<UserIdentity>,
    /// how long to wait for the TCP connection
    connection_timeout: Option<Duration>,
    session: SessionOptions,
    registry: Option<Arc<ServiceRegistry>>,
}

impl<'a> Default for ClientAssociationOptions<'a> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            role_selections: Vec::new(),
            user_identity: None,
            connection_timeout: None,
            session: SessionOptions::default(),
            registry: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        self.called_ae_title = if cae.is_empty() {
            "ANY-SCP".into()
        } else {
            cae
        };
        self
    }

    /// Override the application context name.
    pub fn application_context_name<T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.application_context_name = name.into();
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    ///
    /// Presentation contexts are given the odd identifiers 1, 3, 5...
    /// in the order in which they were added.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Propose the SCU and SCP roles which this node takes
    /// for the given SOP class.
    ///
    /// Without a role selection,
    /// the requestor is the SCU and the acceptor is the SCP.
    pub fn with_role_selection(mut self, sop_class_uid: &str, scu_role: bool, scp_role: bool) -> Self {
        self.role_selections.push(RoleSelection {
            sop_class_uid: trim_uid(Cow::from(sop_class_uid)).into_owned(),
            scu_role,
            scp_role,
        });
        self
    }

    /// Negotiate the given user identity.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Set how long to wait for the TCP connection to be established.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.session = self.session.max_pdu_length(value);
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.session = self.session.strict(strict);
        self
    }

    /// Replace the session options (timeouts, operation limits, and so on).
    ///
    /// This overrides any previous call to
    /// [`max_pdu_length`](Self::max_pdu_length) or [`strict`](Self::strict).
    pub fn session_options(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    /// Use this registry to serve requests sent by the peer.
    pub fn service_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the association request PDU described by these options.
    pub fn association_rq(&self) -> Result<AssociationRQ> {
        // fail if no presentation contexts were provided: they represent intent,
        // should not be omitted by the user
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        let presentation_contexts = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|uid| uid.to_string()).collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.session.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        ];
        if let Some(window) = self.session.proposed_window() {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(window));
        }
        user_variables.extend(
            self.role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );
        user_variables.push(UserVariableItem::ImplementationVersionName(
            IMPLEMENTATION_VERSION_NAME.to_string(),
        ));
        if let Some(identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity.clone()));
        }

        Ok(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts,
            user_variables,
        })
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// Blocks until the association is established or has failed.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<Association> {
        let rq = self.association_rq()?;
        let socket = connect(address, self.connection_timeout)?;
        debug!(
            "Connected to {:?}, requesting association with {}",
            socket.peer_addr().ok(),
            rq.called_ae_title
        );

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ServiceRegistry::new()));
        let (association, _ac) = Association::request(socket, rq, self.session, registry)?;
        Ok(association)
    }
}

fn connect<A: ToSocketAddrs>(address: A, timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return TcpStream::connect(address).context(ConnectSnafu),
    };

    let mut last_error = None;
    for addr in address.to_socket_addrs().context(ConnectSnafu)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    let e = last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    });
    Err(e).context(ConnectSnafu)
}
