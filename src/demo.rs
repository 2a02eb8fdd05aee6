//! A small bot wired from the pieces of this crate; `waystation replay` drives it.
//!
//! * `/start` is guarded by [`AcceptTerms`], which asks once per
//!   conversation and then resumes `/start` itself.
//! * After that a two-station signup road collects a name and confirms it;
//!   "back" on the confirmation returns to the name question with its
//!   attempt counter restored.
//! * [`Mute`] is asked on every update and swallows everything while the
//!   chat is muted.

use std::sync::Arc;

use chat_update::{LogLevel, Update};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::FlowConfig;
use crate::context::Handling;
use crate::dispatch::{Args, Call, Flow, MethodTable};
use crate::error::{FlowError, FlowResult};
use crate::inline::InlineKind;
use crate::logger::Logger;
use crate::middle::{Gate, MiddleAction};
use crate::pipeline::{Matcher, Pipeline};
use crate::proceed;
use crate::road::Road;
use crate::section::Section;
use crate::station::{serde_field, Sign, Station, StationCore};

pub const SIGNUP: &str = "signup";
const TERMS_ACCEPTED: &str = "terms_accepted";
const MUTED: &str = "muted";
const MAX_NAME_ATTEMPTS: u32 = 3;

fn answer_text<'a>(cx: &Handling<'a>) -> &'a str {
    let update = cx.update();
    update.text_body().or(update.callback_data()).unwrap_or_default().trim()
}

/// Terms of service, asked once per conversation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AcceptTerms;

impl Gate for AcceptTerms {
    const ID: &'static str = "accept_terms";
    const CATEGORY: &'static str = "legal";
    const IGNORE_LOOP: bool = true;

    fn make(_cx: &Handling<'_>) -> Self {
        AcceptTerms
    }

    fn is_required(&mut self, _call: &Call, cx: &mut Handling<'_>) -> FlowResult<bool> {
        Ok(cx.step().recall(TERMS_ACCEPTED) != Some(json!(true)))
    }

    fn main(this: &mut MiddleAction<Self>, call: Call, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        cx.reply("Before we start, please accept the terms. Reply \"yes\" to accept.");
        this.inline(InlineKind::Menu, "terms", call.into_args(), cx)?;
        this.await_reply("answer", cx)?;
        Ok(Flow::Continue(()))
    }

    fn methods() -> MethodTable<MiddleAction<Self>> {
        MethodTable::<MiddleAction<Self>>::new().method("answer", &[], |this, _, cx| {
            let answer = answer_text(cx);
            if answer.eq_ignore_ascii_case("yes") || answer == "terms:accept" {
                cx.step().remember(TERMS_ACCEPTED, json!(true));
                cx.reply("Thanks!");
                return Ok(this.redirect(Args::new(), cx)?.map(|_| Value::Null));
            }
            cx.reply("You need to accept the terms to continue. Reply \"yes\" to accept.");
            this.await_reply("answer", cx)?;
            Ok(Flow::Continue(Value::Null))
        })
    }
}

/// Swallows every update while the chat is muted, except `/unmute`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Mute;

impl Gate for Mute {
    const ID: &'static str = "mute";
    const CATEGORY: &'static str = "moderation";

    fn make(_cx: &Handling<'_>) -> Self {
        Mute
    }

    fn is_required(&mut self, _call: &Call, cx: &mut Handling<'_>) -> FlowResult<bool> {
        let muted = cx.step().recall(MUTED) == Some(json!(true));
        Ok(muted && answer_text(cx) != "/unmute")
    }

    fn main(_this: &mut MiddleAction<Self>, _call: Call, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        cx.reply("(muted, send /unmute)");
        Ok(Flow::Continue(()))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Welcome;

impl Section for Welcome {
    const NAME: &'static str = "welcome";

    fn make(_cx: &Handling<'_>) -> Self {
        Welcome
    }

    fn methods() -> MethodTable<Self> {
        MethodTable::<Self>::new()
            .method("start", &[], |_, call, cx| {
                proceed!(MiddleAction::<AcceptTerms>::required_here(call.here(), Args::new(), cx)?);
                cx.reply("Welcome! Let's set up your profile.");
                let road = cx
                    .registry()
                    .find_road(SIGNUP)
                    .ok_or_else(|| FlowError::UnknownHandler(SIGNUP.to_string()))?;
                road.start(Args::new(), cx)
            })
            .method("mute", &[], |_, _, cx| {
                cx.step().remember(MUTED, json!(true));
                cx.reply("Muted.");
                Ok(Flow::Continue(Value::Null))
            })
            .method("unmute", &[], |_, _, cx| {
                cx.step().forget(MUTED);
                cx.reply("Unmuted.");
                Ok(Flow::Continue(Value::Null))
            })
            .method("fallback", &["text"], |_, call, cx| {
                let text = call.str_arg("text").unwrap_or_default().to_string();
                cx.reply(format!("I don't know what to do with \"{}\". Send /start.", text));
                Ok(Flow::Continue(Value::Null))
            })
    }
}

/// The profile being built; logs every event it receives.
pub struct Profile {
    logger: Logger,
}

impl Profile {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl Sign for Profile {
    fn name(&self) -> &str {
        "profile"
    }

    fn fire(&self, event: &str, args: Args, cx: &mut Handling<'_>) -> FlowResult<Flow<Value>> {
        self.logger.log(LogLevel::Info, "profile", &format!("{} {}", event, serde_json::to_string(&args)?));
        if event == "completed" {
            if let Some(name) = args.get("name") {
                cx.step().remember("profile_name", name.clone());
            }
        }
        Ok(Flow::Continue(Value::Null))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NameDraft {
    attempts: u32,
    name: Option<String>,
}

pub struct AskName {
    core: StationCore,
    draft: NameDraft,
}

impl Station for AskName {
    const NAME: &'static str = "ask_name";

    fn make(core: StationCore) -> Self {
        AskName {
            core: core.keeping(&["attempts", "name"]).reverting_with("again"),
            draft: NameDraft::default(),
        }
    }

    fn core(&self) -> &StationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StationCore {
        &mut self.core
    }

    fn actions() -> MethodTable<Self> {
        MethodTable::<Self>::new()
            .method("main", &[], |this, _, cx| {
                cx.reply("What is your name?");
                this.await_reply("answer", cx)?;
                Ok(Flow::Continue(Value::Null))
            })
            .method("again", &[], |this, _, cx| {
                let previous = this.draft.name.clone().unwrap_or_default();
                cx.reply(format!("Let's fix it. You said \"{}\". What is your name?", previous));
                this.await_reply("answer", cx)?;
                Ok(Flow::Continue(Value::Null))
            })
            .method("answer", &[], |this, _, cx| {
                let text = answer_text(cx);
                if text.starts_with('/') {
                    return Ok(Flow::Skip);
                }
                if text.chars().count() < 2 {
                    this.draft.attempts += 1;
                    if this.draft.attempts >= MAX_NAME_ATTEMPTS {
                        cx.reply("Let's try again later.");
                        this.core().road().finish(cx);
                        return Ok(Flow::Continue(Value::Null));
                    }
                    cx.reply("That doesn't look like a name, try again.");
                    this.await_reply("answer", cx)?;
                    return Ok(Flow::Continue(Value::Null));
                }
                this.draft.name = Some(text.to_string());
                this.travel(Confirm::NAME, Args::new().with("name", text), cx)
            })
    }

    fn read_field(&self, field: &str) -> FlowResult<Value> {
        serde_field::read(&self.draft, Self::NAME, field)
    }

    fn write_field(&mut self, field: &str, value: Value) -> FlowResult<()> {
        serde_field::write(&mut self.draft, Self::NAME, field, value)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Confirmation {
    name: Option<String>,
}

pub struct Confirm {
    core: StationCore,
    data: Confirmation,
}

impl Station for Confirm {
    const NAME: &'static str = "confirm";

    fn make(core: StationCore) -> Self {
        Confirm {
            core: core.keeping(&["name"]),
            data: Confirmation::default(),
        }
    }

    fn core(&self) -> &StationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StationCore {
        &mut self.core
    }

    fn actions() -> MethodTable<Self> {
        MethodTable::<Self>::new()
            .method("main", &["name"], |this, call, cx| {
                let name = call.str_arg("name").unwrap_or_default().to_string();
                this.dialog("confirm", Args::new().with("name", name.as_str()), cx)?;
                cx.reply(format!("Is \"{}\" right? Reply yes or back.", name));
                this.data.name = Some(name);
                this.await_reply("answer", cx)?;
                Ok(Flow::Continue(Value::Null))
            })
            .method("answer", &[], |this, _, cx| {
                let name = this.data.name.clone().unwrap_or_default();
                match answer_text(cx).to_ascii_lowercase().as_str() {
                    "yes" => {
                        proceed!(this.fire_sign("completed", Args::new().with("name", name.as_str()), cx)?);
                        cx.reply(format!("Welcome aboard, {}!", name));
                        this.core().road().finish(cx);
                        Ok(Flow::Continue(Value::Null))
                    }
                    "back" => {
                        let road = this.core().road().clone();
                        road.back(Args::new(), cx)
                    }
                    _ => {
                        cx.reply("Please reply yes or back.");
                        this.await_reply("answer", cx)?;
                        Ok(Flow::Continue(Value::Null))
                    }
                }
            })
    }

    fn read_field(&self, field: &str) -> FlowResult<Value> {
        serde_field::read(&self.data, Self::NAME, field)
    }

    fn write_field(&mut self, field: &str, value: Value) -> FlowResult<()> {
        serde_field::write(&mut self.data, Self::NAME, field, value)
    }
}

pub fn signup_road(logger: Logger) -> FlowResult<Arc<Road>> {
    Road::builder(SIGNUP, Arc::new(Profile::new(logger)))
        .station::<AskName>()
        .station::<Confirm>()
        .link(AskName::NAME, Confirm::NAME)
        .start(AskName::NAME)
        .build()
}

/// The demo bot's pipeline.
pub fn bot(config: &FlowConfig, logger: Logger) -> FlowResult<Pipeline> {
    Ok(Pipeline::builder()
        .config(config)
        .gate::<Mute>(Args::new())
        .gate_type::<AcceptTerms>()
        .section::<Welcome>()
        .road(signup_road(logger)?)
        .route(Matcher::Command("start".into()), Welcome::NAME, "start")
        .route(Matcher::Command("mute".into()), Welcome::NAME, "mute")
        .route(Matcher::Command("unmute".into()), Welcome::NAME, "unmute")
        .route(Matcher::Text, Welcome::NAME, "fallback")
        .build())
}

/// One line of a replay file: either a full [`Update`] or a short form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplayLine {
    Full(Update),
    Text { chat: String, text: String },
    Callback { chat: String, callback: String },
}

impl ReplayLine {
    pub fn into_update(self) -> Update {
        match self {
            ReplayLine::Full(update) => update,
            ReplayLine::Text { chat, text } => Update::text(&chat, &text),
            ReplayLine::Callback { chat, callback } => Update::callback(&chat, &callback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::HandlingOutcome;
    use crate::road::Journey;
    use crate::step::{InMemoryStep, StepStore};

    fn say(pipeline: &Pipeline, step: &InMemoryStep, text: &str) -> Vec<String> {
        pipeline.handle(&Update::text("demo", text), step).unwrap().replies
    }

    #[test]
    fn test_signup_happy_path() {
        let pipeline = bot(&FlowConfig::default(), Logger::tracing()).unwrap();
        let step = InMemoryStep::new();

        assert_eq!(say(&pipeline, &step, "/start")[0], "Before we start, please accept the terms. Reply \"yes\" to accept.");
        assert_eq!(
            say(&pipeline, &step, "yes"),
            vec!["Thanks!", "Welcome! Let's set up your profile.", "What is your name?"]
        );
        assert_eq!(say(&pipeline, &step, "Ada"), vec!["Is \"Ada\" right? Reply yes or back."]);
        assert_eq!(say(&pipeline, &step, "yes"), vec!["Welcome aboard, Ada!"]);

        assert_eq!(step.recall("profile_name"), Some(json!("Ada")));
        assert!(step.recall(&Journey::key(SIGNUP)).is_none());
        assert!(step.get().is_none());
    }

    #[test]
    fn test_back_restores_attempts() {
        let pipeline = bot(&FlowConfig::default(), Logger::tracing()).unwrap();
        let step = InMemoryStep::new();
        step.remember(TERMS_ACCEPTED, json!(true));

        say(&pipeline, &step, "/start");
        say(&pipeline, &step, "x");
        say(&pipeline, &step, "Bob");
        assert_eq!(
            say(&pipeline, &step, "back"),
            vec!["Let's fix it. You said \"Bob\". What is your name?"]
        );

        let pending = step.get().unwrap();
        assert_eq!(pending.state, json!({ "attempts": 1, "name": "Bob" }));
    }

    #[test]
    fn test_mute_swallows_updates() {
        let pipeline = bot(&FlowConfig::default(), Logger::tracing()).unwrap();
        let step = InMemoryStep::new();

        assert_eq!(say(&pipeline, &step, "/mute"), vec!["Muted."]);
        let report = pipeline.handle(&Update::text("demo", "/start"), step.as_ref()).unwrap();
        assert_eq!(report.handled_by, vec!["mute"]);
        assert_eq!(report.outcome, HandlingOutcome::Handled);
        assert_eq!(say(&pipeline, &step, "/unmute"), vec!["Unmuted."]);
    }

    #[test]
    fn test_command_escapes_pending_question() {
        let pipeline = bot(&FlowConfig::default(), Logger::tracing()).unwrap();
        let step = InMemoryStep::new();
        step.remember(TERMS_ACCEPTED, json!(true));

        say(&pipeline, &step, "/start");
        let replies = say(&pipeline, &step, "/start");
        assert_eq!(replies, vec!["Welcome! Let's set up your profile.", "What is your name?"]);
    }

    #[test]
    fn test_replay_line_forms() {
        let text: ReplayLine = serde_json::from_str(r#"{"chat":"c","text":"/start"}"#).unwrap();
        assert_eq!(text.into_update().text_body(), Some("/start"));

        let callback: ReplayLine = serde_json::from_str(r#"{"chat":"c","callback":"terms:accept"}"#).unwrap();
        assert_eq!(callback.into_update().callback_data(), Some("terms:accept"));

        let full = serde_json::to_string(&Update::text("c", "hi")).unwrap();
        let line: ReplayLine = serde_json::from_str(&full).unwrap();
        assert!(matches!(line, ReplayLine::Full(_)));
    }
}
