mod common;

use chatmimic::chat::trim_reply;
use chatmimic::data::{ASSISTANT_LABEL, OTHER_LABEL};
use chatmimic::{ChatBot, GenerationConfig};

#[test]
fn chatbot_over_a_real_model_keeps_a_bounded_history() {
    let model = common::tiny_model();
    let generation = GenerationConfig {
        max_new_tokens: 6,
        seed: Some(3),
        ..GenerationConfig::chat()
    };
    let mut chatbot = ChatBot::with_generation(&model, 3, generation).unwrap();

    for input in ["hi", "how are you ?", "what is up ?"] {
        let reply = chatbot.add_message(input).unwrap();
        assert!(!reply.contains(ASSISTANT_LABEL));
        assert!(!reply.contains(OTHER_LABEL));
        assert_eq!(reply, trim_reply(&reply));
    }

    let history: Vec<_> = chatbot.history().collect();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1], (OTHER_LABEL, "what is up ?"));
    assert_eq!(history[2].0, ASSISTANT_LABEL);

    chatbot.reset();
    assert_eq!(
        chatbot.add_input_and_make_prompt("hi"),
        "[OTHER]: hi\n[ASSISTANT]: "
    );
}
