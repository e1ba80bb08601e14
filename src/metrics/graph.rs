use crate::error::Error;
use crate::metrics::actions::{DisplayAction, DisplayStep};
use crate::metrics::enrich::Enricher;
use crate::metrics::record::MetricsRecord;
use crate::metrics::store::DisplayState;
use crate::state::{Graph, Node, Transition, Trigger};
use std::sync::Arc;

pub const START: &str = "start";
pub const POWER_ON: &str = "poweron";
pub const INPUT_ACTIVE: &str = "inputactive";
pub const BLANK: &str = "blank";
pub const POWER_STANDBY: &str = "powerstandby";

/// Build the display power/input/blank graph.
pub fn display_graph(enricher: Arc<Enricher>) -> Result<Graph<DisplayState, MetricsRecord>, Error> {
    let step = |s: DisplayStep| DisplayAction::shared(s, &enricher);
    let on = || Trigger::Equals("on".to_string());
    let standby = || Trigger::Equals("standby".to_string());

    // Volume and mute changes never leave the node they arrive in.
    let audio = |node: Node<DisplayState, MetricsRecord>, id: &str, timed: bool| {
        let (volume, mute) = if timed {
            (DisplayStep::VolumeChange, DisplayStep::MuteChange)
        } else {
            (DisplayStep::VolumeStore, DisplayStep::MuteStore)
        };
        node.transition(
            Transition::new("volume", Trigger::Any, id)
                .internal()
                .action(step(volume)),
        )
        .transition(
            Transition::new("muted", Trigger::Any, id)
                .internal()
                .action(step(mute)),
        )
    };

    let start = Node::new(START).transition(
        Transition::new("power", on(), POWER_ON).named("initial-transition"),
    );

    let power_on = Node::new(POWER_ON)
        .on_enter(step(DisplayStep::PowerOnStore))
        .on_exit(step(DisplayStep::InputRecord))
        .transition(Transition::new("input", Trigger::Any, INPUT_ACTIVE))
        .transition(Transition::new("blanked", Trigger::Equals("true".into()), BLANK))
        .transition(
            Transition::new("power", standby(), POWER_STANDBY)
                .action(step(DisplayStep::UnblankedRecord)),
        );
    let power_on = audio(power_on, POWER_ON, true);

    let input_active = Node::new(INPUT_ACTIVE)
        .on_enter(step(DisplayStep::InputStore))
        .on_exit(step(DisplayStep::InputRecord))
        .transition(Transition::new("input", Trigger::Any, INPUT_ACTIVE))
        .transition(Transition::new("blanked", Trigger::Equals("true".into()), BLANK))
        .transition(
            Transition::new("power", standby(), POWER_STANDBY)
                .action(step(DisplayStep::UnblankedRecord)),
        );
    let input_active = audio(input_active, INPUT_ACTIVE, true);

    let blank = Node::new(BLANK)
        .on_enter(step(DisplayStep::EnterBlank))
        .on_exit(step(DisplayStep::BlankedRecord))
        .transition(
            Transition::new("input", Trigger::Any, BLANK)
                .internal()
                .action(step(DisplayStep::InputStore)),
        )
        .transition(Transition::new(
            "blanked",
            Trigger::Equals("false".into()),
            INPUT_ACTIVE,
        ))
        .transition(Transition::new("power", standby(), POWER_STANDBY));
    let blank = audio(blank, BLANK, true);

    let power_standby = Node::new(POWER_STANDBY)
        .on_enter(step(DisplayStep::StandbyEnter))
        .on_exit(step(DisplayStep::StandbyExit))
        .transition(Transition::new("power", on(), POWER_ON))
        .transition(
            Transition::new("input", Trigger::Any, POWER_STANDBY)
                .internal()
                .action(step(DisplayStep::InputStore)),
        );
    let power_standby = audio(power_standby, POWER_STANDBY, false);

    Graph::compile(
        vec![start, power_on, input_active, blank, power_standby],
        START,
    )
}
