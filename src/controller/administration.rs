//! Kiosk mode and card administration.
use super::{flag_details, wait_for_card, Controller, Error, OperationResult};
use crate::ports::{parameter, HostContext, MessageId, Status, StatusSink, UserPrompt};
use crate::token::TokenError;
use crate::transport::Transport;

impl<T, S, H, P> Controller<T, S, H, P>
where
    T: Transport,
    S: StatusSink,
    H: HostContext,
    P: UserPrompt,
{
    /// Watch cards being inserted and removed, calling back into the host after each
    /// removal. Only returns on error.
    pub(super) fn kiosk(&mut self) -> Result<OperationResult, Error> {
        self.require_backend()?;
        self.status.add_detail("entering kiosk mode");
        self.status.set_status(Status::Normal, MessageId::Kiosk);
        let callback = self.host.parameter(parameter::REMOVE_CARD_CALLBACK);
        loop {
            let observer = self.observer();
            let status: &mut dyn StatusSink = &mut self.status;
            self.backends.with_fallback(observer, |session| {
                if !session.is_token_present()? {
                    session.wait_for_token_present()?;
                }
                status.add_detail("waiting for card removal");
                session.remove_card()
            })?;
            self.drain_events();
            self.status.add_detail("card removed");
            match &callback {
                Some(name) => {
                    tracing::debug!("invoking host callback {name}");
                    self.host.invoke_callback(name);
                }
                None => self.status.add_detail(&format!(
                    "no {} parameter, not calling back",
                    parameter::REMOVE_CARD_CALLBACK
                )),
            }
        }
    }

    /// PIN administration on the native backend. No result is sent to the service.
    pub(super) fn administration(
        &mut self,
        change_pin: bool,
        unblock_pin: bool,
        logoff: bool,
        remove_card: bool,
    ) -> Result<OperationResult, Error> {
        flag_details(
            &mut self.status,
            &[
                ("change pin", change_pin),
                ("unblock pin", unblock_pin),
                ("remove card", remove_card),
                ("logoff", logoff),
            ],
        );
        let observer = self.observer();
        let status: &mut dyn StatusSink = &mut self.status;
        let result = self.backends.with_native(observer, |session| {
            if !session.supports_administration() {
                return Err(TokenError::Unsupported("card administration"));
            }
            wait_for_card(session, status)?;
            status.set_status(Status::Normal, MessageId::Administration);
            if unblock_pin {
                status.add_detail("unblocking PIN");
                session.unblock_pin()?;
            }
            if change_pin {
                status.add_detail("changing PIN");
                session.change_pin()?;
            }
            if logoff {
                session.logoff(None)?;
            }
            if remove_card {
                status.set_status(Status::Normal, MessageId::RemoveCard);
                session.remove_card()?;
            }
            Ok(())
        });
        self.drain_events();
        result?;
        Ok(OperationResult::AdministrationCompleted)
    }
}
