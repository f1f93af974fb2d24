use serde_json::json;
use std::rc::Rc;
use virvel::{
    Activity, Broker, ConsumeOptions, Content, Context, Environment, LoopBehaviour, LoopCharacteristics, Message,
    Parent, Properties, Settings,
    api::{EXECUTE_COMPLETED, EXECUTE_START, EXECUTION_EXCHANGE},
};

extern crate pretty_env_logger;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let broker = Broker::new();
    let environment = Environment::new()
        .variables(json!({ "fruits": ["apple", "pear", "plum", "fig", "kiwi"] }))
        .settings(Settings { batch_size: 2 });
    let activity = Activity::new(
        "peel",
        "bpmn:Task",
        &broker,
        Rc::new(environment),
        Rc::new(Context::new()),
    );

    // The activity body, completes each iteration with the peeled fruit
    let body = broker.clone();
    broker.subscribe_tmp(
        EXECUTION_EXCHANGE,
        EXECUTE_START,
        move |_, message| {
            if message.content.is_root_scope {
                return;
            }
            let fruit = message.content.get("fruit").cloned().unwrap_or_default();
            body.publish(
                EXECUTION_EXCHANGE,
                EXECUTE_COMPLETED,
                message
                    .content
                    .clone()
                    .with_output(format!("peeled {}", fruit.as_str().unwrap_or("?"))),
                Properties::default(),
            );
        },
        ConsumeOptions::tag("body"),
    );

    broker.subscribe_tmp(
        EXECUTION_EXCHANGE,
        EXECUTE_COMPLETED,
        |_, message| {
            if !message.content.is_multi_instance {
                println!(
                    "{} completed with {}",
                    message.content.execution_id.as_deref().unwrap_or_default(),
                    message.content.output.clone().unwrap_or_default()
                );
            }
        },
        ConsumeOptions::tag("printer"),
    );

    for (execution_id, behaviour) in [
        ("peel_1", LoopBehaviour::sequential()),
        ("peel_2", LoopBehaviour::parallel()),
    ] {
        let characteristics = LoopCharacteristics::new(
            &activity,
            behaviour.collection("${environment.variables.fruits}", Some("fruit")),
        );
        let content = Content {
            is_root_scope: true,
            ..Content::new("peel", execution_id).with_parent(Some(Parent::new("process", "process_1")))
        };
        characteristics.execute(&Message::new(EXECUTION_EXCHANGE, EXECUTE_START, content))?;
    }
    Ok(())
}
