use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use gpui::{
    AnyElement, App, AppContext, Context, FocusHandle, InteractiveElement, IntoElement,
    KeyDownEvent, ObjectFit, ParentElement, Render, RenderImage, SharedString, Styled,
    StyledImage, TitlebarOptions, Window, WindowOptions, div, img, px,
};
use gpui_component::{
    Root,
    button::{Button, ButtonVariants},
    h_flex, v_flex,
};
use image::{Frame as ImageFrame, ImageBuffer, Rgba};

use crate::tester::{Command, TesterSnapshot};

mod render_util;
mod tester_view;

const VIEW_WIDTH: f32 = 720.0;
const VIEW_RATIO: f32 = 4.0 / 3.0;

pub fn launch_ui(
    app: &mut App,
    title: &str,
    snapshots: Receiver<TesterSnapshot>,
    commands: Sender<Command>,
    collecting: bool,
) -> gpui::Result<()> {
    let window_options = WindowOptions {
        titlebar: Some(TitlebarOptions {
            title: Some(SharedString::from(title.to_string())),
            appears_transparent: false,
            traffic_light_position: None,
        }),
        ..Default::default()
    };

    app.open_window(window_options, move |window, app| {
        let view = app.new(|cx| TesterView::new(snapshots, commands, collecting, cx));
        app.new(|cx| Root::new(view, window, cx))
    })?;

    Ok(())
}

struct TesterView {
    snapshots: Receiver<TesterSnapshot>,
    commands: Sender<Command>,
    collecting: bool,
    focus_handle: FocusHandle,
    focused: bool,
    latest: Option<TesterSnapshot>,
    latest_image: Option<Arc<RenderImage>>,
    stopped: bool,
}

impl TesterView {
    fn new(
        snapshots: Receiver<TesterSnapshot>,
        commands: Sender<Command>,
        collecting: bool,
        cx: &mut Context<'_, Self>,
    ) -> Self {
        Self {
            snapshots,
            commands,
            collecting,
            focus_handle: cx.focus_handle(),
            focused: false,
            latest: None,
            latest_image: None,
            stopped: false,
        }
    }

    fn send(&mut self, command: Command, cx: &mut Context<'_, Self>) {
        if self.commands.send(command).is_err() {
            log::warn!("tester loop is gone, dropping {command:?}");
            self.stopped = true;
        }
        if command == Command::Quit {
            cx.quit();
        }
        cx.notify();
    }
}

impl Render for TesterView {
    fn render(
        &mut self,
        window: &mut Window,
        cx: &mut Context<'_, Self>,
    ) -> impl gpui::IntoElement {
        cx.defer_in(window, |_, _, cx| {
            cx.notify();
        });

        if !self.focused {
            window.focus(&self.focus_handle);
            self.focused = true;
        }

        loop {
            match self.snapshots.try_recv() {
                Ok(snapshot) => {
                    if let Some(image) = render_util::frame_to_image(&snapshot.frame) {
                        self.replace_latest_image(image, window, cx);
                    }
                    self.latest = Some(snapshot);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stopped = true;
                    break;
                }
            }
        }

        self.render_tester(cx)
    }
}
