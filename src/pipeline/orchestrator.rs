//! Run orchestrator. Drives one polling run end to end.
//!
//! Each run walks the same path: write a run record, load settings and
//! routing rules, authenticate with the mail provider, list candidate
//! emails, and for each email match a rule, fetch its PDF attachments,
//! extract, process, and deliver each one, then apply the configured
//! post-process action and write the email's audit row. The last-check
//! watermark advances after the loop, and the run record is finalized
//! exactly once.
//!
//! A failure inside one attachment never aborts the loop. A failure before
//! the email loop starts (config load, authentication, listing) fails the
//! whole run. Audit writes and post-process actions are best-effort: their
//! failures are logged and never override the outcome they describe.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::MailSettings;
use crate::deliver::{DeliveryDispatcher, DeliveryReport};
use crate::error::{ConfigError, Error, Result, StoreError};
use crate::extract::ExtractionModel;
use crate::mail::{AccessToken, EmailMessage, MailProvider, PdfAttachment};
use crate::pipeline::factory::AdapterFactory;
use crate::pipeline::rules::match_rule;
use crate::store::{
    EmailStatus, ExtractionRecord, PollingRun, ProcessedEmailRecord, RecordStore, RunStatus,
};
use crate::template::ExtractionTemplate;
use crate::template::prompt::build_prompt;

/// What one run did, returned to the caller that triggered it.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub found: u32,
    pub processed: u32,
    pub failed: u32,
    pub error: Option<String>,
}

/// Collaborators resolved once per run during config load.
struct RunContext {
    provider: Arc<dyn MailProvider>,
    model: Arc<dyn ExtractionModel>,
    dispatcher: DeliveryDispatcher,
    rules: Vec<crate::store::ProcessingRule>,
    templates: HashMap<Uuid, ExtractionTemplate>,
}

enum EmailOutcome {
    Processed,
    Failed,
}

/// The polling pipeline. One instance serves every mailbox; each call to
/// [`PollingPipeline::run_once`] is an independent run.
pub struct PollingPipeline {
    store: Arc<dyn RecordStore>,
    factory: Arc<dyn AdapterFactory>,
}

impl PollingPipeline {
    pub fn new(store: Arc<dyn RecordStore>, factory: Arc<dyn AdapterFactory>) -> Self {
        Self { store, factory }
    }

    /// Poll every enabled mailbox whose interval has elapsed.
    pub async fn run_due(&self) -> Vec<RunSummary> {
        let mailboxes = match self.store.list_mail_settings().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Failed to list mailboxes; skipping this tick");
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut summaries = Vec::new();
        for settings in mailboxes.iter().filter(|s| s.enabled && s.is_due(now)) {
            summaries.push(self.run_once(settings).await);
        }
        summaries
    }

    /// Poll every configured mailbox now, regardless of schedule. Disabled
    /// mailboxes still produce an empty successful run so the trigger gets
    /// visible feedback.
    pub async fn run_all(&self) -> std::result::Result<Vec<RunSummary>, StoreError> {
        let mailboxes = self.store.list_mail_settings().await?;
        let mut summaries = Vec::with_capacity(mailboxes.len());
        for settings in &mailboxes {
            summaries.push(self.run_once(settings).await);
        }
        Ok(summaries)
    }

    /// Run one poll of one mailbox, start to finish.
    pub async fn run_once(&self, settings: &MailSettings) -> RunSummary {
        let mut run = PollingRun::begin(settings.provider.as_str(), &settings.mailbox);
        info!(
            run_id = %run.id,
            mailbox = %settings.mailbox,
            provider = settings.provider.as_str(),
            "Polling run started"
        );

        if let Err(e) = self.store.insert_run(&run).await {
            warn!(run_id = %run.id, error = %e, "Failed to write run record");
        }

        if !settings.enabled {
            info!(run_id = %run.id, mailbox = %settings.mailbox, "Mailbox is disabled; nothing to poll");
            return self.finalize(run, RunStatus::Success, None).await;
        }

        match self.poll(&mut run, settings).await {
            Ok(()) => self.finalize(run, RunStatus::Success, None).await,
            Err(e) => {
                error!(run_id = %run.id, phase = phase_of(&e), error = %e, "Polling run failed");
                let message = e.to_string();
                self.finalize(run, RunStatus::Failed, Some(message)).await
            }
        }
    }

    /// The fallible middle of a run: everything between the run record's
    /// creation and its finalization.
    async fn poll(&self, run: &mut PollingRun, settings: &MailSettings) -> Result<()> {
        let ctx = self.load_context(settings).await?;

        let token = ctx.provider.authenticate().await?;
        info!(
            run_id = %run.id,
            provider = ctx.provider.provider_name(),
            "Authenticated with mail provider"
        );

        let candidates = ctx
            .provider
            .list_candidate_emails(&token, settings.effective_since())
            .await?;
        run.emails_found = candidates.len() as u32;
        info!(run_id = %run.id, found = run.emails_found, "Listed candidate emails");

        for email in &candidates {
            match self.process_email(run.id, settings, &ctx, &token, email).await {
                EmailOutcome::Processed => run.emails_processed += 1,
                EmailOutcome::Failed => run.emails_failed += 1,
            }
        }

        if let Err(e) = self
            .store
            .update_last_check(&settings.mailbox, Utc::now())
            .await
        {
            warn!(run_id = %run.id, error = %e, "Failed to advance the last-check watermark");
        }
        Ok(())
    }

    /// Resolve rules, templates, the extraction model, and the delivery
    /// collaborators from the store.
    async fn load_context(&self, settings: &MailSettings) -> Result<RunContext> {
        let rules = self.store.list_rules().await?;

        let mut templates = HashMap::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            if templates.contains_key(&rule.template_id) {
                continue;
            }
            match self.store.get_template(rule.template_id).await? {
                Some(template) => {
                    templates.insert(rule.template_id, template);
                }
                None => warn!(
                    rule = %rule.name,
                    template_id = %rule.template_id,
                    "Rule references a missing template"
                ),
            }
        }

        let ai = self.store.get_ai_settings().await?.ok_or_else(|| {
            ConfigError::MissingRequired {
                key: "ai".into(),
                hint: "no extraction model is configured".into(),
            }
        })?;
        let model = self.factory.model(&ai);

        let partner = self
            .store
            .get_partner_settings()
            .await?
            .map(|s| self.factory.partner(&s));
        let transfer = self
            .store
            .get_transfer_settings()
            .await?
            .map(|s| self.factory.transfer(&s));
        let workflow = self
            .store
            .get_workflow_settings()
            .await?
            .map(|s| self.factory.workflow(&s));
        let dispatcher =
            DeliveryDispatcher::new(Arc::clone(&self.store), partner, transfer, workflow);

        let provider = self.factory.mail(settings)?;

        Ok(RunContext {
            provider,
            model,
            dispatcher,
            rules,
            templates,
        })
    }

    async fn process_email(
        &self,
        run_id: Uuid,
        settings: &MailSettings,
        ctx: &RunContext,
        token: &AccessToken,
        email: &EmailMessage,
    ) -> EmailOutcome {
        info!(
            run_id = %run_id,
            message_id = %email.id,
            sender = %email.sender,
            subject = %email.subject,
            "Processing email"
        );

        match self.store.get_processed_success(&email.id).await {
            Ok(Some(_)) => {
                info!(run_id = %run_id, message_id = %email.id, "Email was already processed; skipping");
                self.record_email(email_record(
                    run_id,
                    email,
                    None,
                    Vec::new(),
                    Vec::new(),
                    EmailStatus::Failed,
                    Some("already processed".into()),
                    None,
                ))
                .await;
                return EmailOutcome::Failed;
            }
            Ok(None) => {}
            Err(e) => {
                // Worst case on proceeding is a duplicate delivery.
                warn!(run_id = %run_id, message_id = %email.id, error = %e, "Duplicate check failed; continuing");
            }
        }

        let Some(rule) = match_rule(&email.sender, &email.subject, &ctx.rules) else {
            info!(run_id = %run_id, message_id = %email.id, sender = %email.sender, "No rule matched; skipping email");
            self.record_email(email_record(
                run_id,
                email,
                None,
                Vec::new(),
                Vec::new(),
                EmailStatus::Failed,
                Some("no matching rule".into()),
                None,
            ))
            .await;
            return EmailOutcome::Failed;
        };

        let Some(template) = ctx.templates.get(&rule.template_id) else {
            warn!(
                run_id = %run_id,
                message_id = %email.id,
                rule = %rule.name,
                "Matched rule has no loadable template; skipping email"
            );
            self.record_email(email_record(
                run_id,
                email,
                Some((rule.id, rule.template_id)),
                Vec::new(),
                Vec::new(),
                EmailStatus::Failed,
                Some(format!("template {} not found", rule.template_id)),
                None,
            ))
            .await;
            return EmailOutcome::Failed;
        };

        let attachments = match ctx.provider.find_pdf_attachments(token, &email.id).await {
            Ok(a) => a,
            Err(e) => {
                error!(
                    run_id = %run_id,
                    message_id = %email.id,
                    phase = "fetch",
                    error = %e,
                    "Failed to fetch attachments"
                );
                self.record_email(email_record(
                    run_id,
                    email,
                    Some((rule.id, template.id)),
                    Vec::new(),
                    Vec::new(),
                    EmailStatus::Failed,
                    Some(e.to_string()),
                    None,
                ))
                .await;
                return EmailOutcome::Failed;
            }
        };
        if attachments.is_empty() {
            info!(run_id = %run_id, message_id = %email.id, "No PDF attachments; skipping email");
            self.record_email(email_record(
                run_id,
                email,
                Some((rule.id, template.id)),
                Vec::new(),
                Vec::new(),
                EmailStatus::Failed,
                Some("no attachments".into()),
                None,
            ))
            .await;
            return EmailOutcome::Failed;
        }

        let mut names = Vec::with_capacity(attachments.len());
        let mut pages = Vec::with_capacity(attachments.len());
        let mut failures = Vec::new();
        let mut sequence_id = None;
        for attachment in &attachments {
            names.push(attachment.filename.clone());
            pages.push(attachment.page_count);
            match self
                .process_attachment(run_id, settings, ctx, email, template, attachment)
                .await
            {
                Ok(report) => {
                    if report.sequence_id.is_some() {
                        sequence_id = report.sequence_id;
                    }
                }
                Err(e) => failures.push(format!("{}: {e}", attachment.filename)),
            }
        }

        let success = failures.is_empty();
        let (action, folder) = settings.action_for_outcome(success);
        if let Err(e) = ctx
            .provider
            .apply_post_process_action(token, &email.id, action, folder)
            .await
        {
            // The delivery outcome stands; housekeeping is best-effort.
            warn!(
                run_id = %run_id,
                message_id = %email.id,
                action = action.as_str(),
                error = %e,
                "Post-process action failed"
            );
        }

        let (status, error) = if success {
            (EmailStatus::Processed, None)
        } else {
            (EmailStatus::Failed, Some(failures.join("; ")))
        };
        self.record_email(email_record(
            run_id,
            email,
            Some((rule.id, template.id)),
            names,
            pages,
            status,
            error,
            sequence_id,
        ))
        .await;

        if success {
            EmailOutcome::Processed
        } else {
            EmailOutcome::Failed
        }
    }

    /// One attachment: extraction record, model call, processing, dispatch.
    /// The record is marked after each phase.
    async fn process_attachment(
        &self,
        run_id: Uuid,
        settings: &MailSettings,
        ctx: &RunContext,
        email: &EmailMessage,
        template: &ExtractionTemplate,
        attachment: &PdfAttachment,
    ) -> Result<DeliveryReport> {
        info!(
            run_id = %run_id,
            message_id = %email.id,
            filename = %attachment.filename,
            template = %template.name,
            pages = attachment.page_count,
            "Processing attachment"
        );

        let record = ExtractionRecord::begin(
            run_id,
            &email.id,
            template.id,
            &attachment.filename,
            attachment.page_count,
        );
        let extraction_id = record.id;
        if let Err(e) = self.store.insert_extraction(&record).await {
            warn!(run_id = %run_id, filename = %attachment.filename, error = %e, "Failed to write extraction record");
        }

        match self
            .extract_and_deliver(ctx, settings, template, attachment, extraction_id)
            .await
        {
            Ok(report) => {
                if let Err(e) = self
                    .store
                    .mark_extraction_delivered(extraction_id, report.reference.as_deref())
                    .await
                {
                    warn!(run_id = %run_id, filename = %attachment.filename, error = %e, "Failed to mark extraction delivered");
                }
                info!(
                    run_id = %run_id,
                    message_id = %email.id,
                    filename = %attachment.filename,
                    sequence_id = ?report.sequence_id,
                    "Attachment delivered"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    run_id = %run_id,
                    message_id = %email.id,
                    filename = %attachment.filename,
                    phase = phase_of(&e),
                    error = %e,
                    "Attachment failed"
                );
                if let Err(mark) = self
                    .store
                    .mark_extraction_failed(extraction_id, &e.to_string())
                    .await
                {
                    warn!(run_id = %run_id, filename = %attachment.filename, error = %mark, "Failed to mark extraction failed");
                }
                Err(e)
            }
        }
    }

    async fn extract_and_deliver(
        &self,
        ctx: &RunContext,
        settings: &MailSettings,
        template: &ExtractionTemplate,
        attachment: &PdfAttachment,
        extraction_id: Uuid,
    ) -> Result<DeliveryReport> {
        let prompt = build_prompt(template);
        let raw = ctx
            .model
            .extract(&attachment.bytes, &attachment.filename, &prompt.text)
            .await?;
        let mut output = crate::postprocess::process_response(template, &raw, Utc::now())?;

        let payload = output.serialized();
        if let Err(e) = self
            .store
            .mark_extraction_extracted(extraction_id, &payload)
            .await
        {
            warn!(filename = %attachment.filename, error = %e, "Failed to record extracted payload");
        }

        let report = ctx
            .dispatcher
            .dispatch(template, &mut output, attachment, &settings.mailbox)
            .await?;
        Ok(report)
    }

    async fn record_email(&self, record: ProcessedEmailRecord) {
        if let Err(e) = self.store.insert_processed_email(&record).await {
            warn!(message_id = %record.message_id, error = %e, "Failed to write processed-email record");
        }
    }

    async fn finalize(
        &self,
        mut run: PollingRun,
        status: RunStatus,
        error: Option<String>,
    ) -> RunSummary {
        run.finish(status, error);
        if let Err(e) = self.store.finish_run(&run).await {
            warn!(run_id = %run.id, error = %e, "Failed to finalize run record");
        }
        info!(
            run_id = %run.id,
            status = ?run.status,
            found = run.emails_found,
            processed = run.emails_processed,
            failed = run.emails_failed,
            "Polling run finished"
        );
        RunSummary {
            run_id: run.id,
            status: run.status,
            found: run.emails_found,
            processed: run.emails_processed,
            failed: run.emails_failed,
            error: run.error,
        }
    }
}

/// The phase label for a failure, derived from its error family.
fn phase_of(e: &Error) -> &'static str {
    match e {
        Error::Config(_) => "configure",
        Error::Auth(_) => "authenticate",
        Error::Mail(_) => "fetch",
        Error::Ai(_) => "extract",
        Error::Process(_) => "process",
        Error::Delivery(_) => "deliver",
        Error::Store(_) => "store",
    }
}

#[allow(clippy::too_many_arguments)]
fn email_record(
    run_id: Uuid,
    email: &EmailMessage,
    routed: Option<(Uuid, Uuid)>,
    attachment_names: Vec<String>,
    page_counts: Vec<u32>,
    status: EmailStatus,
    error: Option<String>,
    sequence_id: Option<i64>,
) -> ProcessedEmailRecord {
    ProcessedEmailRecord {
        id: Uuid::new_v4(),
        run_id,
        message_id: email.id.clone(),
        sender: email.sender.clone(),
        subject: email.subject.clone(),
        received_at: email.received_at,
        rule_id: routed.map(|(rule_id, _)| rule_id),
        template_id: routed.map(|(_, template_id)| template_id),
        attachment_count: attachment_names.len() as u32,
        attachment_names,
        page_counts,
        status,
        error,
        sequence_id,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use secrecy::SecretString;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::result::Result;
    use std::sync::Mutex;

    use crate::config::{AiSettings, PartnerSettings, TransferSettings, WorkflowSettings};
    use crate::deliver::{FileKind, FileTransfer, PartnerGateway, WorkflowBundle, WorkflowEngine};
    use crate::error::{AiError, AuthError, DeliveryError, MailError};
    use crate::mail::{MailProviderKind, PostProcessAction};
    use crate::store::{ExtractionStatus, LibSqlStore, ProcessingRule};
    use crate::template::{DeliveryMode, OutputFormat};

    // ── Mocks ───────────────────────────────────────────────────────

    struct MockMail {
        emails: Vec<EmailMessage>,
        attachments: HashMap<String, Vec<PdfAttachment>>,
        actions: Mutex<Vec<(String, PostProcessAction, Option<String>)>>,
        fail_auth: bool,
    }

    impl MockMail {
        fn new(
            emails: Vec<EmailMessage>,
            attachments: HashMap<String, Vec<PdfAttachment>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                emails,
                attachments,
                actions: Mutex::new(Vec::new()),
                fail_auth: false,
            })
        }
    }

    #[async_trait]
    impl MailProvider for MockMail {
        fn provider_name(&self) -> &'static str {
            "mock"
        }

        async fn authenticate(&self) -> Result<AccessToken, AuthError> {
            if self.fail_auth {
                return Err(AuthError::Rejected {
                    provider: "mock".into(),
                });
            }
            Ok(AccessToken::new("tok"))
        }

        async fn list_candidate_emails(
            &self,
            _token: &AccessToken,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<EmailMessage>, MailError> {
            Ok(self.emails.clone())
        }

        async fn get_message_details(
            &self,
            _token: &AccessToken,
            _message_id: &str,
        ) -> Result<EmailMessage, MailError> {
            unimplemented!("not used by these tests")
        }

        async fn find_pdf_attachments(
            &self,
            _token: &AccessToken,
            message_id: &str,
        ) -> Result<Vec<PdfAttachment>, MailError> {
            Ok(self.attachments.get(message_id).cloned().unwrap_or_default())
        }

        async fn apply_post_process_action(
            &self,
            _token: &AccessToken,
            message_id: &str,
            action: PostProcessAction,
            folder: Option<&str>,
        ) -> Result<(), MailError> {
            self.actions.lock().unwrap().push((
                message_id.to_string(),
                action,
                folder.map(String::from),
            ));
            Ok(())
        }
    }

    struct MockModel {
        response: String,
    }

    #[async_trait]
    impl ExtractionModel for MockModel {
        async fn extract(
            &self,
            _document: &[u8],
            _filename: &str,
            _prompt: &str,
        ) -> Result<String, AiError> {
            Ok(self.response.clone())
        }
    }

    struct MockEngine {
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowEngine for MockEngine {
        async fn start_execution(
            &self,
            bundle: WorkflowBundle<'_>,
        ) -> Result<String, DeliveryError> {
            self.started
                .lock()
                .unwrap()
                .push(bundle.trigger_address.to_string());
            Ok("exec-9".into())
        }
    }

    struct MockFactory {
        mail: Arc<MockMail>,
        model: Arc<MockModel>,
        partner: Option<Arc<dyn PartnerGateway>>,
        transfer: Option<Arc<dyn FileTransfer>>,
        workflow: Option<Arc<dyn WorkflowEngine>>,
    }

    impl AdapterFactory for MockFactory {
        fn mail(
            &self,
            _settings: &MailSettings,
        ) -> std::result::Result<Arc<dyn MailProvider>, ConfigError> {
            Ok(self.mail.clone())
        }

        fn model(&self, _settings: &AiSettings) -> Arc<dyn ExtractionModel> {
            self.model.clone()
        }

        fn partner(&self, _settings: &PartnerSettings) -> Arc<dyn PartnerGateway> {
            self.partner.clone().expect("partner not mocked")
        }

        fn transfer(&self, _settings: &TransferSettings) -> Arc<dyn FileTransfer> {
            self.transfer.clone().expect("transfer not mocked")
        }

        fn workflow(&self, _settings: &WorkflowSettings) -> Arc<dyn WorkflowEngine> {
            self.workflow.clone().expect("workflow not mocked")
        }
    }

    struct RecordingTransfer {
        uploads: Mutex<Vec<(FileKind, String)>>,
    }

    #[async_trait]
    impl FileTransfer for RecordingTransfer {
        async fn upload(
            &self,
            kind: FileKind,
            filename: &str,
            _bytes: &[u8],
        ) -> Result<(), DeliveryError> {
            self.uploads
                .lock()
                .unwrap()
                .push((kind, filename.to_string()));
            Ok(())
        }
    }

    struct RecordingPartner {
        posts: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl PartnerGateway for RecordingPartner {
        async fn post_payload(
            &self,
            route: &str,
            payload: &Value,
        ) -> Result<String, DeliveryError> {
            self.posts
                .lock()
                .unwrap()
                .push((route.to_string(), payload.clone()));
            Ok("ok".into())
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────

    fn mail_settings() -> MailSettings {
        MailSettings {
            enabled: true,
            provider: MailProviderKind::Graph,
            mailbox: "intake@example.com".into(),
            tenant_id: Some("tenant".into()),
            client_id: "client".into(),
            client_secret: SecretString::from("secret"),
            refresh_token: None,
            poll_interval_minutes: 5,
            check_all_messages: false,
            last_check: None,
            success_action: PostProcessAction::MarkRead,
            success_folder: None,
            failure_action: PostProcessAction::None,
            failure_folder: None,
        }
    }

    fn ai_settings() -> AiSettings {
        AiSettings {
            model: "claude-sonnet-4-5".into(),
            api_key: SecretString::from("sk-test"),
            max_tokens: 4096,
        }
    }

    fn workflow_template() -> ExtractionTemplate {
        ExtractionTemplate {
            id: Uuid::new_v4(),
            name: "orders".into(),
            format: OutputFormat::Json,
            body: "{\"shipper\": \"\"}".into(),
            field_mappings: Vec::new(),
            array_splits: Vec::new(),
            array_entries: Vec::new(),
            delivery: DeliveryMode::Workflow,
            partner_route: None,
            sequence_field: None,
        }
    }

    fn rule_for(template: &ExtractionTemplate) -> ProcessingRule {
        ProcessingRule {
            id: Uuid::new_v4(),
            name: "acme".into(),
            sender_pattern: "acme.com".into(),
            subject_pattern: "".into(),
            priority: 10,
            enabled: true,
            template_id: template.id,
        }
    }

    fn email(id: &str, sender: &str) -> EmailMessage {
        EmailMessage {
            id: id.into(),
            sender: sender.into(),
            subject: "New order".into(),
            received_at: Utc::now(),
        }
    }

    fn pdf(filename: &str) -> PdfAttachment {
        PdfAttachment {
            filename: filename.into(),
            bytes: b"%PDF-1.4".to_vec(),
            page_count: 1,
        }
    }

    async fn seeded_store(
        template: &ExtractionTemplate,
        rule: &ProcessingRule,
    ) -> Arc<LibSqlStore> {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store.save_mail_settings(&mail_settings()).await.unwrap();
        store.save_template(template).await.unwrap();
        store.save_rule(rule).await.unwrap();
        store.save_ai_settings(&ai_settings()).await.unwrap();
        store
    }

    async fn configure_workflow(store: &LibSqlStore) {
        store
            .save_workflow_settings(&WorkflowSettings {
                endpoint: "http://workflow.local/start".into(),
                api_key: SecretString::from("wf"),
            })
            .await
            .unwrap();
    }

    fn pipeline_with(
        store: Arc<LibSqlStore>,
        mail: Arc<MockMail>,
        model_response: &str,
        workflow: Option<Arc<dyn WorkflowEngine>>,
    ) -> PollingPipeline {
        let factory = Arc::new(MockFactory {
            mail,
            model: Arc::new(MockModel {
                response: model_response.into(),
            }),
            partner: None,
            transfer: None,
            workflow,
        });
        PollingPipeline::new(store, factory)
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn disabled_mailbox_finalizes_an_empty_successful_run() {
        let template = workflow_template();
        let rule = rule_for(&template);
        let store = seeded_store(&template, &rule).await;
        let mail = MockMail::new(Vec::new(), HashMap::new());
        let pipeline = pipeline_with(store.clone(), mail, "{}", None);

        let mut settings = mail_settings();
        settings.enabled = false;
        let summary = pipeline.run_once(&settings).await;

        assert!(matches!(summary.status, RunStatus::Success));
        assert_eq!((summary.found, summary.processed, summary.failed), (0, 0, 0));

        let runs = store.list_recent_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(matches!(runs[0].status, RunStatus::Success));
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn missing_ai_settings_fails_the_run() {
        let template = workflow_template();
        let rule = rule_for(&template);
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store.save_mail_settings(&mail_settings()).await.unwrap();
        store.save_template(&template).await.unwrap();
        store.save_rule(&rule).await.unwrap();
        let mail = MockMail::new(vec![email("m1", "orders@acme.com")], HashMap::new());
        let pipeline = pipeline_with(store.clone(), mail, "{}", None);

        let summary = pipeline.run_once(&mail_settings()).await;
        assert!(matches!(summary.status, RunStatus::Failed));
        assert!(summary.error.unwrap().contains("ai"));
    }

    #[tokio::test]
    async fn auth_failure_fails_the_run_before_the_loop() {
        let template = workflow_template();
        let rule = rule_for(&template);
        let store = seeded_store(&template, &rule).await;
        let mail = Arc::new(MockMail {
            emails: vec![email("m1", "orders@acme.com")],
            attachments: HashMap::new(),
            actions: Mutex::new(Vec::new()),
            fail_auth: true,
        });
        let pipeline = pipeline_with(store.clone(), mail, "{}", None);

        let summary = pipeline.run_once(&mail_settings()).await;
        assert!(matches!(summary.status, RunStatus::Failed));
        assert_eq!(summary.found, 0);

        // The watermark must not advance on a failed run.
        let boxes = store.list_mail_settings().await.unwrap();
        assert!(boxes[0].last_check.is_none());
    }

    #[tokio::test]
    async fn workflow_delivery_updates_every_record() {
        let template = workflow_template();
        let rule = rule_for(&template);
        let store = seeded_store(&template, &rule).await;
        configure_workflow(&store).await;

        let engine = Arc::new(MockEngine {
            started: Mutex::new(Vec::new()),
        });
        let mail = MockMail::new(
            vec![email("m1", "orders@acme.com")],
            HashMap::from([("m1".to_string(), vec![pdf("order.pdf")])]),
        );
        let pipeline = pipeline_with(
            store.clone(),
            mail.clone(),
            "{\"shipper\": \"ACME\"}",
            Some(engine.clone()),
        );

        let summary = pipeline.run_once(&mail_settings()).await;
        assert!(matches!(summary.status, RunStatus::Success));
        assert_eq!((summary.found, summary.processed, summary.failed), (1, 1, 0));

        let extractions = store.list_extractions_for_run(summary.run_id).await.unwrap();
        assert_eq!(extractions.len(), 1);
        assert_eq!(extractions[0].status, ExtractionStatus::Delivered);
        assert_eq!(extractions[0].delivery_reference.as_deref(), Some("exec-9"));
        assert_eq!(
            extractions[0].payload.as_deref(),
            Some("{\"shipper\":\"ACME\"}")
        );

        let prior = store.get_processed_success("m1").await.unwrap().unwrap();
        assert_eq!(prior.status, EmailStatus::Processed);
        assert_eq!(prior.attachment_names, vec!["order.pdf".to_string()]);
        assert_eq!(prior.rule_id, Some(rule.id));

        // Engine saw the monitored mailbox as the trigger address.
        assert_eq!(
            *engine.started.lock().unwrap(),
            vec!["intake@example.com".to_string()]
        );

        // Success action applied, watermark advanced.
        let actions = mail.actions.lock().unwrap();
        assert_eq!(
            *actions,
            vec![("m1".to_string(), PostProcessAction::MarkRead, None)]
        );
        let boxes = store.list_mail_settings().await.unwrap();
        assert!(boxes[0].last_check.is_some());
    }

    #[tokio::test]
    async fn direct_delivery_draws_a_sequence_id_and_posts() {
        let mut template = workflow_template();
        template.delivery = DeliveryMode::Direct;
        template.partner_route = Some("/api/orders".into());
        template.sequence_field = Some("orderId".into());
        let rule = rule_for(&template);
        let store = seeded_store(&template, &rule).await;
        store
            .save_partner_settings(&PartnerSettings {
                base_url: "http://partner.local".into(),
                api_key: SecretString::from("pk"),
                token_route: None,
            })
            .await
            .unwrap();
        store
            .save_transfer_settings(&TransferSettings {
                base_url: "http://transfer.local".into(),
                api_key: SecretString::from("tk"),
                pdf_upload_path: "/pdf".into(),
                markup_upload_path: "/xml".into(),
            })
            .await
            .unwrap();

        let partner = Arc::new(RecordingPartner {
            posts: Mutex::new(Vec::new()),
        });
        let transfer = Arc::new(RecordingTransfer {
            uploads: Mutex::new(Vec::new()),
        });
        let mail = MockMail::new(
            vec![email("m1", "orders@acme.com")],
            HashMap::from([("m1".to_string(), vec![pdf("order.pdf")])]),
        );
        let factory = Arc::new(MockFactory {
            mail: mail.clone(),
            model: Arc::new(MockModel {
                response: "{\"shipper\": \"ACME\"}".into(),
            }),
            partner: Some(partner.clone()),
            transfer: Some(transfer.clone()),
            workflow: None,
        });
        let pipeline = PollingPipeline::new(store.clone(), factory);

        let summary = pipeline.run_once(&mail_settings()).await;
        assert!(matches!(summary.status, RunStatus::Success));

        let posts = partner.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "/api/orders");
        assert_eq!(posts[0].1["orderId"], 1);

        let uploads = transfer.uploads.lock().unwrap();
        assert_eq!(
            *uploads,
            vec![(FileKind::SourcePdf, "order.pdf".to_string())]
        );

        let prior = store.get_processed_success("m1").await.unwrap().unwrap();
        assert_eq!(prior.sequence_id, Some(1));
    }

    #[tokio::test]
    async fn unmatched_email_is_recorded_and_left_alone() {
        let template = workflow_template();
        let rule = rule_for(&template);
        let store = seeded_store(&template, &rule).await;
        let mail = MockMail::new(vec![email("m1", "noreply@other.com")], HashMap::new());
        let pipeline = pipeline_with(store.clone(), mail.clone(), "{}", None);

        let summary = pipeline.run_once(&mail_settings()).await;
        assert!(matches!(summary.status, RunStatus::Success));
        assert_eq!((summary.found, summary.processed, summary.failed), (1, 0, 1));

        // Skips do not mutate the source email.
        assert!(mail.actions.lock().unwrap().is_empty());
        // And do not count as successful processing for idempotency.
        assert!(store.get_processed_success("m1").await.unwrap().is_none());
    }
}
