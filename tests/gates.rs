use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use waystation::pipeline::Matcher;
use waystation::proceed;
use waystation::step::InMemoryStep;
use waystation::{
    Args, Call, Flow, FlowError, FlowResult, Gate, GateOrdering, Handling, HandlingOutcome, MethodTable, MiddleAction,
    Pipeline, Section, StepStore, Update,
};

const ADULT: &str = "adult";
const HUMAN: &str = "human";

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgeCheck;

impl Gate for AgeCheck {
    const ID: &'static str = "age_check";
    const CATEGORY: &'static str = "legal";

    fn make(_cx: &Handling<'_>) -> Self {
        AgeCheck
    }

    fn is_required(&mut self, _call: &Call, cx: &mut Handling<'_>) -> FlowResult<bool> {
        Ok(cx.step().recall(ADULT) != Some(json!(true)))
    }

    fn main(this: &mut MiddleAction<Self>, _call: Call, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        cx.reply("How old are you?");
        this.await_reply("answer", cx)?;
        Ok(Flow::Continue(()))
    }

    fn methods() -> MethodTable<MiddleAction<Self>> {
        MethodTable::<MiddleAction<Self>>::new().method("answer", &[], |this, _, cx| {
            let age: u32 = cx.update().text_body().and_then(|t| t.trim().parse().ok()).unwrap_or(0);
            if age < 18 {
                cx.reply("Too young.");
                return Ok(Flow::Continue(Value::Null));
            }
            cx.step().remember(ADULT, json!(true));
            Ok(this.redirect(Args::new(), cx)?.map(|_| Value::Null))
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Captcha;

impl Gate for Captcha {
    const ID: &'static str = "captcha";
    const CATEGORY: &'static str = "security";

    fn make(_cx: &Handling<'_>) -> Self {
        Captcha
    }

    fn is_required(&mut self, _call: &Call, cx: &mut Handling<'_>) -> FlowResult<bool> {
        Ok(cx.step().recall(HUMAN).is_none())
    }

    fn main(this: &mut MiddleAction<Self>, _call: Call, cx: &mut Handling<'_>) -> FlowResult<Flow<()>> {
        cx.reply("2 + 2?");
        this.await_reply("solve", cx)?;
        Ok(Flow::Continue(()))
    }

    fn methods() -> MethodTable<MiddleAction<Self>> {
        MethodTable::<MiddleAction<Self>>::new().method("solve", &[], |this, _, cx| {
            if cx.update().text_body() != Some("4") {
                cx.reply("2 + 2?");
                this.await_reply("solve", cx)?;
                return Ok(Flow::Continue(Value::Null));
            }
            cx.step().remember(HUMAN, json!(true));
            Ok(this.redirect(Args::new(), cx)?.map(|_| Value::Null))
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Shop;

impl Section for Shop {
    const NAME: &'static str = "shop";

    fn make(_cx: &Handling<'_>) -> Self {
        Shop
    }

    fn methods() -> MethodTable<Self> {
        MethodTable::<Self>::new()
            .method("buy", &["item"], |_, call, cx| {
                let item = call.str_arg("item").unwrap_or("nothing").to_string();
                proceed!(MiddleAction::<AgeCheck>::required_at("shop", "buy", Args::new().with("item", item.as_str()), cx)?);
                cx.reply(format!("bought {}", item));
                Ok(Flow::Continue(Value::Null))
            })
            .method("wine", &[], |_, _, cx| {
                let args = Args::new().with("item", "wine");
                proceed!(MiddleAction::<AgeCheck>::required_at("shop", "buy", args.clone(), cx)?);
                Shop::invokes("buy", args, cx)
            })
            .method("echo", &["text"], |_, call, cx| {
                let text = call.str_arg("text").unwrap_or_default().to_string();
                cx.reply(format!("echo:{}", text));
                Ok(Flow::Continue(Value::Null))
            })
            .method("lost", &[], |_, _, cx| {
                MiddleAction::<AgeCheck>::required_at("nowhere", "buy", Args::new(), cx)?;
                Ok(Flow::Continue(Value::Null))
            })
            .method("short", &[], |_, _, cx| {
                MiddleAction::<AgeCheck>::required(&["shop"], Args::new(), cx)?;
                Ok(Flow::Continue(Value::Null))
            })
    }
}

fn shop() -> Pipeline {
    Pipeline::builder()
        .gate_type::<AgeCheck>()
        .section::<Shop>()
        .route(Matcher::Command("wine".into()), "shop", "wine")
        .route(Matcher::Command("lost".into()), "shop", "lost")
        .route(Matcher::Command("short".into()), "shop", "short")
        .route(Matcher::Text, "shop", "echo")
        .build()
}

#[test]
fn required_gate_returns_to_target_with_its_arguments() {
    let pipeline = shop();
    let step = InMemoryStep::new();

    let asked = pipeline.handle(&Update::text("c", "/wine"), step.as_ref()).unwrap();
    assert_eq!(asked.outcome, HandlingOutcome::Stopped);
    assert_eq!(asked.replies, vec!["How old are you?"]);
    assert_eq!(step.get().map(|s| s.handler), Some("age_check".to_string()));

    let bought = pipeline.handle(&Update::text("c", "30"), step.as_ref()).unwrap();
    assert_eq!(bought.handled_by, vec!["step"]);
    assert_eq!(bought.replies, vec!["bought wine"]);
    assert!(step.get().is_none());

    // already satisfied, so the target body runs directly
    let again = pipeline.handle(&Update::text("c", "/wine"), step.as_ref()).unwrap();
    assert_eq!(again.replies, vec!["bought wine"]);
}

#[test]
fn declined_gate_does_not_redirect() {
    let pipeline = shop();
    let step = InMemoryStep::new();

    pipeline.handle(&Update::text("c", "/wine"), step.as_ref()).unwrap();
    let report = pipeline.handle(&Update::text("c", "12"), step.as_ref()).unwrap();
    assert_eq!(report.replies, vec!["Too young."]);
    assert!(step.get().is_none());
    assert!(step.recall(ADULT).is_none());
}

#[test]
fn invalid_targets_fail_before_the_gate_runs() {
    let pipeline = shop();
    let step = InMemoryStep::new();

    let err = pipeline.handle(&Update::text("c", "/lost"), step.as_ref()).unwrap_err();
    assert!(matches!(err, FlowError::UnknownHandler(ref h) if h == "nowhere"));
    assert!(err.is_usage());

    let err = pipeline.handle(&Update::text("c", "/short"), step.as_ref()).unwrap_err();
    assert!(matches!(err, FlowError::RedirectArity(1)));
    assert!(step.get().is_none());
}

#[test]
fn pipeline_gate_repeats_the_interrupted_update() {
    let pipeline = Pipeline::builder()
        .gate::<Captcha>(Args::new())
        .section::<Shop>()
        .route(Matcher::Text, "shop", "echo")
        .build();
    let step = InMemoryStep::new();

    let first = pipeline.handle(&Update::text("c", "hello"), step.as_ref()).unwrap();
    assert_eq!(first.handled_by, vec!["captcha"]);
    assert_eq!(first.replies, vec!["2 + 2?"]);

    let wrong = pipeline.handle(&Update::text("c", "5"), step.as_ref()).unwrap();
    assert_eq!(wrong.handled_by, vec!["step"]);
    assert_eq!(wrong.replies, vec!["2 + 2?"]);

    let solved = pipeline.handle(&Update::text("c", "4"), step.as_ref()).unwrap();
    assert_eq!(solved.repeats, 1);
    assert_eq!(solved.handled_by, vec!["step", "route:shop::echo"]);
    assert_eq!(solved.replies, vec!["echo:4"]);

    let later = pipeline.handle(&Update::text("c", "bye"), step.as_ref()).unwrap();
    assert_eq!(later.handled_by, vec!["route:shop::echo"]);
}

#[test]
fn gates_are_ordered_by_category() {
    let pipeline = Pipeline::builder()
        .gate::<AgeCheck>(Args::new())
        .gate::<Captcha>(Args::new())
        .ordering(GateOrdering::from_list("security, legal"))
        .section::<Shop>()
        .route(Matcher::Text, "shop", "echo")
        .build();

    assert_eq!(pipeline.chain(), vec!["captcha", "age_check", "step", "route:shop::echo"]);
}
