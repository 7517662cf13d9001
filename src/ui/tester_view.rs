use super::render_util::{banner_colors, status_color};
use super::{
    AnyElement, Arc, Button, ButtonVariants, Command, Context, InteractiveElement, IntoElement,
    KeyDownEvent, ObjectFit, ParentElement, RenderImage, SharedString, Styled, StyledImage,
    TesterView, VIEW_RATIO, VIEW_WIDTH, Window, div, h_flex, img, px, v_flex,
};

impl TesterView {
    pub(super) fn render_tester(&mut self, cx: &mut Context<'_, Self>) -> AnyElement {
        let frame_view: AnyElement = if let Some(image) = &self.latest_image {
            img(image.clone())
                .size_full()
                .object_fit(ObjectFit::Contain)
                .into_any_element()
        } else {
            div()
                .size_full()
                .flex()
                .items_center()
                .justify_center()
                .text_sm()
                .text_color(gpui::rgb(0x8b95a5))
                .child("Waiting for camera...")
                .into_any_element()
        };

        let mut camera_shell = div()
            .relative()
            .w(px(VIEW_WIDTH))
            .h(px(VIEW_WIDTH / VIEW_RATIO))
            .overflow_hidden()
            .rounded_t_lg()
            .bg(gpui::rgb(0x000000))
            .child(frame_view);
        if let Some(banner) = self.latest.as_ref().and_then(|s| s.banner.as_ref()) {
            let (background, text) = banner_colors(banner);
            let mut panel = v_flex()
                .absolute()
                .top_4()
                .left_4()
                .p_3()
                .gap_1()
                .rounded_lg()
                .bg(gpui::rgba(background));
            for line in banner.lines() {
                panel = panel.child(div().text_sm().text_color(gpui::rgb(text)).child(line));
            }
            camera_shell = camera_shell.child(panel);
        } else if !self.collecting && self.latest.is_some() {
            camera_shell = camera_shell.child(
                div()
                    .absolute()
                    .top_4()
                    .w_full()
                    .flex()
                    .justify_center()
                    .text_sm()
                    .text_color(gpui::rgb(0x3b82f6))
                    .child("Place hand here"),
            );
        }

        let (status, color, fps) = match &self.latest {
            Some(snapshot) => (
                snapshot.status.clone(),
                status_color(snapshot.confident, snapshot.hand_detected),
                format!("FPS: {:.1}", snapshot.fps),
            ),
            None => ("Starting...".to_string(), 0x8b95a5, "FPS: --".to_string()),
        };
        let status = if self.stopped { "Tester stopped".to_string() } else { status };

        let mut info = v_flex()
            .gap_2()
            .p_3()
            .child(
                h_flex()
                    .justify_between()
                    .items_center()
                    .child(div().text_xl().text_color(gpui::rgb(color)).child(status))
                    .child(div().text_sm().text_color(gpui::rgb(0xa0aab8)).child(fps)),
            );
        if let Some(snapshot) = &self.latest {
            if !self.collecting && snapshot.hand_detected {
                info = info.child(
                    div()
                        .text_sm()
                        .text_color(gpui::rgb(0xa0aab8))
                        .child(format!("Confidence: {:.0}%", snapshot.confidence * 100.0)),
                );
            }
            if let Some((progress, last)) = &snapshot.collect {
                info = info.child(div().text_sm().text_color(gpui::rgb(0xa0aab8)).child(progress.clone()));
                if let Some(last) = last {
                    info = info.child(div().text_xs().text_color(gpui::rgb(0x8b95a5)).child(last.clone()));
                }
            }
            for line in &snapshot.debug {
                info = info.child(div().text_xs().text_color(gpui::rgb(0x4a5568)).child(line.clone()));
            }
        }

        v_flex()
            .size_full()
            .items_center()
            .p_4()
            .gap_3()
            .bg(gpui::rgb(0x1a2332))
            .track_focus(&self.focus_handle)
            .on_key_down(cx.listener(Self::handle_key))
            .child(
                v_flex()
                    .rounded_lg()
                    .overflow_hidden()
                    .bg(gpui::rgb(0x0f1419))
                    .child(camera_shell)
                    .child(info),
            )
            .child(self.render_controls(cx))
            .into_any_element()
    }

    fn render_controls(&self, cx: &mut Context<'_, Self>) -> AnyElement {
        let mut controls: Vec<(&'static str, &'static str, Command)> = Vec::new();
        if self.collecting {
            controls.extend([
                ("collect-prev", "Prev sign (p)", Command::PrevSign),
                ("collect-capture", "Capture (space)", Command::Capture),
                ("collect-next", "Next sign (n)", Command::NextSign),
            ]);
        } else {
            controls.push(("tester-clear", "Clear (c)", Command::ClearHistory));
        }
        controls.extend([
            ("tester-restart", "Restart camera (r)", Command::RestartCamera),
            ("tester-debug", "Debug (d)", Command::ToggleDebug),
            ("tester-emergency", "Emergency (e)", Command::Emergency),
            ("tester-quit", "Quit (q)", Command::Quit),
        ]);

        let mut row = h_flex().gap_2().items_center();
        for (id, label, command) in controls {
            let button = Button::new(SharedString::from(id))
                .label(label)
                .on_click(cx.listener(move |this, _, _, cx| this.send(command, cx)));
            row = row.child(match command {
                Command::Capture => button.primary(),
                Command::Quit => button.danger(),
                _ => button.outline(),
            });
        }
        row.into_any_element()
    }

    fn handle_key(&mut self, event: &KeyDownEvent, _: &mut Window, cx: &mut Context<'_, Self>) {
        if let Some(command) = Command::from_key(event.keystroke.key.as_str()) {
            self.send(command, cx);
        }
    }

    pub(super) fn replace_latest_image(
        &mut self,
        new_image: Arc<RenderImage>,
        window: &mut Window,
        cx: &mut Context<'_, Self>,
    ) {
        if let Some(old_image) = self.latest_image.replace(new_image) {
            // The sprite atlas keeps every texture until it is dropped explicitly.
            cx.drop_image(old_image, Some(window));
        }
    }
}
