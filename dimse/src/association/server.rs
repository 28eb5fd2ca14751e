//! Association acceptor module
//!
//! The module provides the options for accepting association requests
//! in which this application entity is the acceptor.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::net::TcpStream;
use std::sync::Arc;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::ensure;
use tracing::debug;

use super::{
    session::{Association, SessionOptions},
    uid::trim_uid,
    Error, MissingAbstractSyntaxSnafu, Result,
};
use crate::{
    pdu::{
        AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceProviderASCEReason,
        AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
        PresentationContextResult, PresentationContextResultReason, RoleSelection, UserIdentity,
        UserVariableItem,
    },
    service::ServiceRegistry,
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns Ok(()) if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title.trim_end() {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is an [`Association`]
/// whose incoming requests are dispatched to a [`ServiceRegistry`].
/// Unlike the [`ClientAssociationOptions`],
/// a value of this type can be reused for multiple connections.
///
/// [`ClientAssociationOptions`]: crate::association::ClientAssociationOptions
///
/// The SCP will by default accept all transfer syntaxes
/// supported by the main [transfer syntax registry][1],
/// unless one or more transfer syntaxes are explicitly indicated
/// through calls to [`with_transfer_syntax`][2].
///
/// Access control logic is also available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles.
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`]
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// [`accept_called_ae_title`]: Self::accept_called_ae_title
///
/// [1]: dicom_transfer_syntax_registry
/// [2]: ServerAssociationOptions::with_transfer_syntax
///
/// ## Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use std::sync::Arc;
/// # use dicom_dimse::association::server::ServerAssociationOptions;
/// # use dicom_dimse::service::{ServiceRegistry, VerificationScp};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = ServiceRegistry::new();
/// registry.register(VerificationScp);
/// let registry = Arc::new(registry);
///
/// let options = ServerAssociationOptions::new()
///     .accept_called_ae_title()
///     .ae_title("MY-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1");
///
/// let listener = TcpListener::bind("0.0.0.0:11111")?;
/// let (stream, _) = listener.accept()?;
/// let association = options.establish(stream, registry)?;
/// association.wait_for_socket_close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of accepted abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of accepted transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the expected protocol version
    protocol_version: u16,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// whether requestors may take the SCP role
    accept_scp_role: bool,
    session: SessionOptions,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            promiscuous: false,
            accept_scp_role: true,
            session: SessionOptions::default(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            promiscuous,
            accept_scp_role,
            session,
            ae_access_control: _,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            protocol_version,
            promiscuous,
            accept_scp_role,
            session,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of accepted abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax in the list of accepted transfer syntaxes.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum expected PDU length.
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

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Override whether requestors proposing to take the SCP role
    /// for a SOP class are granted it.
    ///
    /// Enabled by default.
    pub fn accept_scp_role(mut self, accept: bool) -> Self {
        self.accept_scp_role = accept;
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

    pub fn get_session_options(&self) -> &SessionOptions {
        &self.session
    }

    /// Decide on an association request.
    ///
    /// Returns the acknowledgement to send back,
    /// or the rejection if the request cannot be accepted.
    pub fn negotiate(&self, rq: &AssociationRQ) -> std::result::Result<AssociationAC, AssociationRJ> {
        if rq.protocol_version != self.protocol_version {
            debug!("Unsupported protocol version {}", rq.protocol_version);
            return Err(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                ),
            });
        }

        if trim_uid(Cow::from(rq.application_context_name.as_str())) != self.application_context_name
        {
            return Err(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                ),
            });
        }

        self.ae_access_control
            .check_access(
                &self.ae_title,
                &rq.calling_ae_title,
                &rq.called_ae_title,
                rq.user_identity(),
            )
            .map_err(|reason| AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(reason),
            })?;

        let presentation_contexts: Vec<_> = rq
            .presentation_contexts
            .iter()
            .map(|pc| {
                let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str()));
                if !self.promiscuous && !self.abstract_syntax_uids.contains(&abstract_syntax) {
                    return PresentationContextResult {
                        id: pc.id,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        transfer_syntax: "1.2.840.10008.1.2".to_string(),
                    };
                }

                let (transfer_syntax, reason) = self
                    .choose_ts(pc.transfer_syntaxes.iter())
                    .map(|ts| {
                        (
                            trim_uid(Cow::from(ts.as_str())).into_owned(),
                            PresentationContextResultReason::Acceptance,
                        )
                    })
                    .unwrap_or_else(|| {
                        (
                            "1.2.840.10008.1.2".to_string(),
                            PresentationContextResultReason::TransferSyntaxesNotSupported,
                        )
                    });

                PresentationContextResult {
                    id: pc.id,
                    reason,
                    transfer_syntax,
                }
            })
            .collect();

        let accepted_abstract_syntaxes: Vec<Cow<str>> = rq
            .presentation_contexts
            .iter()
            .filter(|pc| {
                presentation_contexts.iter().any(|res: &PresentationContextResult| {
                    res.id == pc.id && res.reason == PresentationContextResultReason::Acceptance
                })
            })
            .map(|pc| trim_uid(Cow::from(pc.abstract_syntax.as_str())))
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.session.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        ];
        if let Some(window) = rq.async_operations_window() {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(
                self.session.granted_window(window),
            ));
        }
        user_variables.extend(
            rq.role_selections()
                .filter(|role| {
                    accepted_abstract_syntaxes
                        .iter()
                        .any(|uid| *uid == trim_uid(Cow::from(role.sop_class_uid.as_str())))
                })
                .map(|role| {
                    UserVariableItem::RoleSelection(RoleSelection {
                        sop_class_uid: role.sop_class_uid.clone(),
                        scu_role: role.scu_role,
                        scp_role: role.scp_role && self.accept_scp_role,
                    })
                }),
        );
        user_variables.push(UserVariableItem::ImplementationVersionName(
            IMPLEMENTATION_VERSION_NAME.to_string(),
        ));
        if rq
            .user_identity()
            .map_or(false, UserIdentity::positive_response_requested)
        {
            user_variables.push(UserVariableItem::UserIdentityResponse(Vec::new()));
        }

        Ok(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts,
            user_variables,
        })
    }

    /// Negotiate an association over the given TCP stream.
    ///
    /// Blocks until the association request arrives and is answered.
    /// Requests from the peer are served by the given registry.
    pub fn establish(
        &self,
        socket: TcpStream,
        registry: Arc<ServiceRegistry>,
    ) -> Result<Association> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        Association::accept(socket, self.session.clone(), registry, |rq| {
            self.negotiate(rq)
        })
    }

    /// Wait for the association request on the given TCP stream
    /// and reject it regardless of its contents.
    pub fn reject(&self, socket: TcpStream, association_rj: AssociationRJ) -> Result<()> {
        let outcome = Association::accept(
            socket,
            self.session.clone(),
            Arc::new(ServiceRegistry::new()),
            |_| Err(association_rj),
        );
        match outcome {
            Err(Error::Rejected { .. }) => Ok(()),
            Err(e) => Err(e),
            // not reachable, the request is always rejected
            Ok(association) => association.abort(),
        }
    }

    /// choose the first transfer syntax to
    /// - be on the options' list of transfer syntaxes, and
    /// - be supported by the main transfer syntax registry.
    ///
    /// If the options' list is empty,
    /// accept the first transfer syntax supported.
    fn choose_ts<I, T>(&self, it: I) -> Option<T>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        if self.transfer_syntax_uids.is_empty() {
            return choose_supported(it);
        }

        it.into_iter().find(|ts| {
            let ts = ts.as_ref();
            self.transfer_syntax_uids.contains(&trim_uid(ts.into())) && is_supported(ts)
        })
    }
}

/// Check that a transfer syntax repository
/// supports the given transfer syntax,
/// meaning that it can parse and decode DICOM data sets.
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(trim_uid(Cow::from(ts_uid)).as_ref())
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax.
///
/// ```
/// # use dicom_dimse::association::server::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first transfer syntax to be supported
/// by the main transfer syntax registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AsyncOperationsWindow, PresentationContextProposed, UserIdentityType};
    use rstest::rstest;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

    #[test]
    fn test_choose_supported() {
        assert_eq!(choose_supported(vec!["1.1.1.1.1"]), None,);

        // string slices, impl VR first
        assert_eq!(
            choose_supported(vec!["1.2.840.10008.1.2", "1.2.840.10008.1.2.1"]),
            Some("1.2.840.10008.1.2"),
        );

        // heap allocated strings slices, expl VR first
        assert_eq!(
            choose_supported(vec![
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2".to_string()
            ]),
            Some("1.2.840.10008.1.2.1".to_string()),
        );
    }

    fn request(called_ae_title: &str) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![
                PresentationContextProposed {
                    id: 1,
                    abstract_syntax: VERIFICATION.to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
                },
                PresentationContextProposed {
                    id: 3,
                    abstract_syntax: CT_IMAGE_STORAGE.to_string(),
                    transfer_syntaxes: vec![
                        "1.2.3.4.5.6.7".to_string(),
                        "1.2.840.10008.1.2.1\0".to_string(),
                    ],
                },
                PresentationContextProposed {
                    id: 5,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
                },
            ],
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        }
    }

    fn options() -> ServerAssociationOptions<'static, AcceptCalledAeTitle> {
        ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title("STORE-SCP")
            .with_abstract_syntax(VERIFICATION)
            .with_abstract_syntax(CT_IMAGE_STORAGE)
    }

    #[test]
    fn accepts_known_abstract_syntaxes() {
        let ac = options().negotiate(&request("STORE-SCP")).unwrap();
        assert_eq!(ac.calling_ae_title, "STORE-SCU");
        assert_eq!(ac.presentation_contexts.len(), 3);

        let results: Vec<_> = ac
            .presentation_contexts
            .iter()
            .map(|pc| (pc.id, pc.reason, pc.transfer_syntax.as_str()))
            .collect();
        assert_eq!(
            results,
            vec![
                (1, PresentationContextResultReason::Acceptance, "1.2.840.10008.1.2"),
                (3, PresentationContextResultReason::Acceptance, "1.2.840.10008.1.2.1"),
                (
                    5,
                    PresentationContextResultReason::AbstractSyntaxNotSupported,
                    "1.2.840.10008.1.2"
                ),
            ]
        );
        assert_eq!(ac.max_pdu_length(), Some(crate::pdu::DEFAULT_MAX_PDU));
        assert_eq!(ac.async_operations_window(), None);
    }

    #[test]
    fn restricted_transfer_syntaxes() {
        let ac = options()
            .with_transfer_syntax("1.2.840.10008.1.2")
            .negotiate(&request("STORE-SCP"))
            .unwrap();
        assert_eq!(
            ac.presentation_contexts[1].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }

    #[rstest]
    #[case(
        request("OTHER-SCP"),
        AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
    )]
    #[case(
        AssociationRQ { protocol_version: 2, ..request("STORE-SCP") },
        AssociationRJSource::ServiceProviderASCE(
            AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported
        )
    )]
    #[case(
        AssociationRQ {
            application_context_name: "1.2.3".to_string(),
            ..request("STORE-SCP")
        },
        AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported
        )
    )]
    fn rejections(#[case] rq: AssociationRQ, #[case] source: AssociationRJSource) {
        let rj = options().negotiate(&rq).unwrap_err();
        assert_eq!(rj.result, AssociationRJResult::Permanent);
        assert_eq!(rj.source, source);
    }

    #[test]
    fn answers_window_roles_and_identity() {
        let mut rq = request("STORE-SCP");
        rq.user_variables.extend(vec![
            UserVariableItem::AsyncOperationsWindow(AsyncOperationsWindow {
                max_operations_invoked: 0,
                max_operations_performed: 3,
            }),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                scu_role: true,
                scp_role: true,
            }),
            // not accepted, not answered
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.2.2.3".to_string(),
                scu_role: false,
                scp_role: true,
            }),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::Username,
                b"jdoe".to_vec(),
                vec![],
            )),
        ]);

        let ac = options()
            .accept_scp_role(false)
            .session_options(SessionOptions::new().max_ops_invoked(2).max_ops_performed(4))
            .negotiate(&rq)
            .unwrap();

        assert_eq!(
            ac.async_operations_window(),
            Some(AsyncOperationsWindow {
                max_operations_invoked: 4,
                max_operations_performed: 2,
            })
        );
        let roles: Vec<_> = ac
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            roles,
            vec![RoleSelection {
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                scu_role: true,
                scp_role: false,
            }]
        );
        assert!(ac
            .user_variables
            .contains(&UserVariableItem::UserIdentityResponse(Vec::new())));
    }
}
